//! Error types for the tap engine
//! Structured error handling using thiserror for better error reporting

use thiserror::Error;

/// Main error type for the tap engine
#[derive(Error, Debug)]
pub enum TapError {
    /// Database connection related errors
    #[error("Database connection error: {message}")]
    Connection { message: String },

    /// Configuration related errors (bad config keys, invalid catalog metadata,
    /// unsupported PostgreSQL versions)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// SQL execution errors
    #[error("SQL error: {message}")]
    Sql {
        message: String,
        statement: Option<String>,
    },

    /// Replication protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// No usable replication slot with the wal2json plugin
    #[error("Unable to find replication slot {candidates} with wal2json")]
    ReplicationSlotNotFound { candidates: String },

    /// A wal2json change event with a kind the engine does not replicate
    #[error("unrecognized replication operation: {kind}")]
    UnsupportedPayloadKind { kind: String },

    /// A source value that cannot be mapped to the wire JSON type system
    #[error("do not know how to marshall value of type {sql_datatype}: {message}")]
    ValueCoercion {
        message: String,
        sql_datatype: String,
    },

    /// Network/IO related errors
    #[error("IO error")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    /// C string conversion errors
    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    /// Generic error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for convenience
pub type TapResult<T> = std::result::Result<T, TapError>;

impl TapError {
    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a SQL error
    pub fn sql<S: Into<String>>(message: S) -> Self {
        Self::Sql {
            message: message.into(),
            statement: None,
        }
    }

    /// Create a SQL error recording the offending statement
    pub fn sql_with_statement<S: Into<String>, Q: Into<String>>(message: S, statement: Q) -> Self {
        Self::Sql {
            message: message.into(),
            statement: Some(statement.into()),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a value coercion error
    pub fn coercion<S: Into<String>, T: Into<String>>(message: S, sql_datatype: T) -> Self {
        Self::ValueCoercion {
            message: message.into(),
            sql_datatype: sql_datatype.into(),
        }
    }
}
