//! PostgreSQL connection handling
//!
//! Provides a safe wrapper around PostgreSQL's C library (libpq) for both
//! regular query execution and the COPY-BOTH replication protocol. Handles
//! connection lifecycle, conninfo construction from the tap configuration,
//! identifier quoting and server-side cursor paging.

use crate::config::TapConfig;
use crate::errors::{TapError, TapResult};
use libpq_sys::*;
use std::ffi::{CStr, CString};
use std::ptr;
use std::time::Duration;
use tracing::debug;

/// Rows fetched per FETCH on a server-side cursor
pub const CURSOR_ITER_SIZE: usize = 20_000;

/// Safe wrapper for a PostgreSQL connection using libpq
///
/// One instance owns one `PGconn`. Replication sessions and regular query
/// sessions use the same wrapper; the replication-specific entry points
/// (`get_copy_data`, `put_copy_data`) are only meaningful after a
/// START_REPLICATION command has switched the connection into COPY-BOTH mode.
pub struct PgConnection {
    conn: *mut PGconn,
}

impl PgConnection {
    /// Establishes a connection using a libpq conninfo string.
    ///
    /// # Arguments
    /// * `conninfo` - connection parameters (e.g., "host=localhost port=5432 dbname=test")
    ///
    /// # Returns
    /// A Result containing either a PgConnection instance or a TapError
    pub fn connect(conninfo: &str) -> TapResult<Self> {
        let c_conninfo = CString::new(conninfo)?;
        let conn = unsafe { PQconnectdb(c_conninfo.as_ptr()) };

        if conn.is_null() {
            return Err(TapError::connection("Failed to allocate connection object"));
        }

        let status = unsafe { PQstatus(conn) };
        if status != ConnStatusType::CONNECTION_OK {
            let error_msg = get_error_message(conn).unwrap_or_else(|| "Unknown error".to_string());
            unsafe { PQfinish(conn) };
            return Err(TapError::connection(format!(
                "Connection failed: {}",
                error_msg
            )));
        }

        Ok(Self { conn })
    }

    /// Executes a SQL command or query and returns the result set.
    pub fn exec(&self, query: &str) -> TapResult<PgResult> {
        let c_query = CString::new(query)?;
        let result = unsafe { PQexec(self.conn, c_query.as_ptr()) };

        if result.is_null() {
            let error_msg =
                get_error_message(self.conn).unwrap_or_else(|| "Unknown error".to_string());
            return Err(TapError::sql_with_statement(error_msg, query));
        }

        let result = PgResult { result };
        if !result.is_ok() && result.status() != ExecStatusType::PGRES_COPY_BOTH {
            let error_msg =
                get_error_message(self.conn).unwrap_or_else(|| "Unknown error".to_string());
            return Err(TapError::sql_with_statement(error_msg, query));
        }

        Ok(result)
    }

    /// Executes a query expected to return exactly one scalar value.
    pub fn query_scalar(&self, query: &str) -> TapResult<Option<String>> {
        let result = self.exec(query)?;
        if result.ntuples() == 0 {
            return Ok(None);
        }
        Ok(result.getvalue(0, 0))
    }

    /// Reads one CopyData payload from a replication stream without blocking.
    ///
    /// Feeds any pending socket input into libpq first, then asks for a
    /// complete row in async mode:
    /// - a complete payload returns `Some(bytes)`
    /// - no complete payload yet returns `None`
    /// - end of COPY or a stream error returns a TapError
    pub fn get_copy_data(&self) -> TapResult<Option<Vec<u8>>> {
        if unsafe { PQconsumeInput(self.conn) } != 1 {
            let error_msg =
                get_error_message(self.conn).unwrap_or_else(|| "Unknown error".to_string());
            return Err(TapError::protocol(error_msg));
        }

        let mut buffer: *mut std::os::raw::c_char = ptr::null_mut();
        let copy_data_len = unsafe { PQgetCopyData(self.conn, &mut buffer, 1) };

        match copy_data_len {
            -2 => {
                let error_msg =
                    get_error_message(self.conn).unwrap_or_else(|| "Unknown error".to_string());
                Err(TapError::protocol(error_msg))
            }
            -1 => {
                // COPY finished; drain the final command status
                let result = PgResult {
                    result: unsafe { PQgetResult(self.conn) },
                };
                if !result.is_ok() {
                    let error_msg =
                        get_error_message(self.conn).unwrap_or_else(|| "Unknown error".to_string());
                    return Err(TapError::protocol(error_msg));
                }
                Err(TapError::protocol("Replication stream ended by server"))
            }
            0 => Ok(None),
            len => {
                if buffer.is_null() {
                    return Err(TapError::protocol("Received null copy buffer"));
                }
                let data = unsafe {
                    std::slice::from_raw_parts(buffer as *const u8, len as usize).to_vec()
                };
                unsafe { PQfreemem(buffer as *mut std::os::raw::c_void) };
                Ok(Some(data))
            }
        }
    }

    /// Sends one CopyData payload on a replication stream.
    pub fn put_copy_data(&self, data: &[u8]) -> TapResult<()> {
        let result = unsafe {
            PQputCopyData(
                self.conn,
                data.as_ptr() as *const std::os::raw::c_char,
                data.len() as i32,
            )
        };

        if result != 1 {
            let error_msg =
                get_error_message(self.conn).unwrap_or_else(|| "Unknown error".to_string());
            return Err(TapError::protocol(format!(
                "Failed to send copy data: {}",
                error_msg
            )));
        }

        Ok(())
    }

    /// Flushes any buffered output on the connection.
    pub fn flush(&self) -> TapResult<()> {
        if unsafe { PQflush(self.conn) } != 0 {
            return Err(TapError::protocol("Failed to flush connection"));
        }
        Ok(())
    }

    /// Blocks until the connection socket is readable or `timeout` elapses.
    ///
    /// This is the replication loop's only suspension point while the WAL
    /// stream is idle. Returns true when there is data to consume.
    pub fn wait_readable(&self, timeout: Duration) -> TapResult<bool> {
        let socket = unsafe { PQsocket(self.conn) };
        if socket < 0 {
            return Err(TapError::connection("Connection has no socket"));
        }

        let mut pollfd = libc::pollfd {
            fd: socket,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout.as_millis() as i32) };
        if rc < 0 {
            return Err(TapError::Io(std::io::Error::last_os_error()));
        }
        Ok(rc > 0 && (pollfd.revents & libc::POLLIN) != 0)
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.conn.is_null() {
            unsafe { PQfinish(self.conn) };
        }
    }
}

fn get_error_message(conn: *const PGconn) -> Option<String> {
    unsafe {
        let error_ptr = PQerrorMessage(conn);
        if error_ptr.is_null() {
            None
        } else {
            Some(CStr::from_ptr(error_ptr).to_string_lossy().trim().to_owned())
        }
    }
}

/// Safe wrapper for a PostgreSQL result set
pub struct PgResult {
    result: *mut PGresult,
}

impl PgResult {
    /// Execution status of the statement that produced this result
    pub fn status(&self) -> ExecStatusType {
        unsafe { PQresultStatus(self.result) }
    }

    /// True for PGRES_TUPLES_OK and PGRES_COMMAND_OK
    pub fn is_ok(&self) -> bool {
        matches!(
            self.status(),
            ExecStatusType::PGRES_TUPLES_OK | ExecStatusType::PGRES_COMMAND_OK
        )
    }

    /// Number of rows in the result
    pub fn ntuples(&self) -> i32 {
        unsafe { PQntuples(self.result) }
    }

    /// Number of columns in the result
    pub fn nfields(&self) -> i32 {
        unsafe { PQnfields(self.result) }
    }

    /// True when the value at (row, col) is SQL NULL
    pub fn is_null(&self, row: i32, col: i32) -> bool {
        unsafe { PQgetisnull(self.result, row, col) == 1 }
    }

    /// Text rendering of the value at (row, col), None for SQL NULL
    pub fn getvalue(&self, row: i32, col: i32) -> Option<String> {
        if self.is_null(row, col) {
            return None;
        }
        let value_ptr = unsafe { PQgetvalue(self.result, row, col) };
        if value_ptr.is_null() {
            None
        } else {
            unsafe { Some(CStr::from_ptr(value_ptr).to_string_lossy().into_owned()) }
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        if !self.result.is_null() {
            unsafe { PQclear(self.result) };
        }
    }
}

/// Connection intent: which host the conninfo targets and whether the session
/// is opened for logical replication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIntent {
    /// Read-only queries; prefers the secondary host when configured
    Query,
    /// The replication session; always the primary, with replication=database
    Replication,
}

/// Opens a connection according to the tap configuration.
///
/// Query connections pin the session time zone to UTC so timestamptz values
/// render with a +00 offset regardless of server defaults.
pub fn open_connection(config: &TapConfig, intent: ConnectionIntent) -> TapResult<PgConnection> {
    let conninfo = build_conninfo(config, intent);
    debug!("Connecting with intent {:?}", intent);
    let conn = PgConnection::connect(&conninfo)?;
    if intent == ConnectionIntent::Query {
        conn.exec("SET TIME ZONE 'UTC'")?;
    }
    Ok(conn)
}

/// Builds a libpq conninfo string from the tap configuration.
pub fn build_conninfo(config: &TapConfig, intent: ConnectionIntent) -> String {
    let (host, port) = match intent {
        ConnectionIntent::Query => config.query_endpoint(),
        ConnectionIntent::Replication => (config.host.as_str(), config.port),
    };

    let mut parts = vec![
        format!("host={}", conninfo_value(host)),
        format!("port={}", port),
        format!("dbname={}", conninfo_value(&config.dbname)),
        format!("user={}", conninfo_value(&config.user)),
        format!("connect_timeout={}", config.connect_timeout),
        "application_name=wal2tap".to_string(),
    ];
    if let Some(password) = &config.password {
        parts.push(format!("password={}", conninfo_value(password)));
    }
    if intent == ConnectionIntent::Replication {
        parts.push("replication=database".to_string());
    }
    parts.join(" ")
}

/// Quotes a conninfo value, escaping backslashes and single quotes.
fn conninfo_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Double-quotes a SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quotes a SQL literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Schema-qualified, quoted table name
pub fn fully_qualified_table_name(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Numeric server version, e.g. 120005 for 12.5
pub fn get_pg_version(conn: &PgConnection) -> TapResult<i64> {
    let version = conn
        .query_scalar("SELECT setting::int AS version FROM pg_settings WHERE name='server_version_num'")?
        .ok_or_else(|| TapError::sql("server_version_num not reported"))?;
    let version = version
        .parse::<i64>()
        .map_err(|e| TapError::sql(format!("Unparseable server version: {}", e)))?;
    debug!("Detected PostgreSQL version: {}", version);
    Ok(version)
}

/// True when the hstore extension is installed and usable
pub fn hstore_available(conn: &PgConnection) -> TapResult<bool> {
    let installed = conn.query_scalar(
        "SELECT installed_version FROM pg_available_extensions WHERE name = 'hstore'",
    )?;
    Ok(installed.is_some())
}

/// A named server-side cursor that pages a large SELECT through FETCH FORWARD.
///
/// Opens its own transaction; `close` commits it. Dropping without close
/// leaves rollback to the connection teardown.
pub struct ServerCursor<'a> {
    conn: &'a PgConnection,
    name: String,
    done: bool,
}

impl<'a> ServerCursor<'a> {
    pub fn declare(conn: &'a PgConnection, name: &str, select_sql: &str) -> TapResult<Self> {
        conn.exec("BEGIN")?;
        conn.exec(&format!(
            "DECLARE {} CURSOR FOR {}",
            quote_ident(name),
            select_sql
        ))?;
        Ok(Self {
            conn,
            name: name.to_string(),
            done: false,
        })
    }

    /// Fetches the next page; None when the cursor is exhausted.
    pub fn next_batch(&mut self) -> TapResult<Option<PgResult>> {
        if self.done {
            return Ok(None);
        }
        let result = self.conn.exec(&format!(
            "FETCH FORWARD {} FROM {}",
            CURSOR_ITER_SIZE,
            quote_ident(&self.name)
        ))?;
        if result.ntuples() == 0 {
            self.done = true;
            return Ok(None);
        }
        Ok(Some(result))
    }

    pub fn close(self) -> TapResult<()> {
        self.conn
            .exec(&format!("CLOSE {}", quote_ident(&self.name)))?;
        self.conn.exec("COMMIT")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_identifiers() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("Case Sensitive"), "\"Case Sensitive\"");
        assert_eq!(quote_ident("with\"quote"), "\"with\"\"quote\"");
        assert_eq!(
            fully_qualified_table_name("public", "COW"),
            "\"public\".\"COW\""
        );
    }

    #[test]
    fn quotes_literals() {
        assert_eq!(quote_literal("o'clock"), "'o''clock'");
    }

    #[test]
    fn conninfo_prefers_secondary_for_queries() {
        let mut config = TapConfig::for_tests();
        config.secondary_host = Some("replica.internal".to_string());
        config.secondary_port = Some(6432);

        let query = build_conninfo(&config, ConnectionIntent::Query);
        assert!(query.contains("host='replica.internal'"));
        assert!(query.contains("port=6432"));
        assert!(!query.contains("replication=database"));

        let repl = build_conninfo(&config, ConnectionIntent::Replication);
        assert!(repl.contains(&format!("host='{}'", config.host)));
        assert!(repl.contains("replication=database"));
    }

    #[test]
    fn conninfo_escapes_password() {
        let mut config = TapConfig::for_tests();
        config.password = Some("it's\\secret".to_string());
        let conninfo = build_conninfo(&config, ConnectionIntent::Query);
        assert!(conninfo.contains("password='it\\'s\\\\secret'"));
    }
}
