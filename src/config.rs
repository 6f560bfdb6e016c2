//! Tap configuration
//!
//! Connection parameters and engine limits, loaded from a JSON config file
//! and validated before any connection is attempted. A secondary host, when
//! configured, serves all read-only query connections; the replication
//! session always goes to the primary.

use crate::errors::{TapError, TapResult};
use serde::Deserialize;
use std::path::Path;

fn default_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u32 {
    30
}

fn default_max_run_seconds() -> u64 {
    43_200
}

fn default_logical_poll_total_seconds() -> u64 {
    10_800
}

fn default_break_at_end_lsn() -> bool {
    true
}

fn default_slot_name_prefix() -> String {
    "pipelinewise".to_string()
}

/// Everything the engine needs to know about one run
#[derive(Debug, Clone, Deserialize)]
pub struct TapConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub dbname: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u32,

    /// Read-only endpoint for non-replication connections
    #[serde(default)]
    pub secondary_host: Option<String>,
    #[serde(default)]
    pub secondary_port: Option<u16>,

    /// Schemas to include during discovery and refresh
    #[serde(default)]
    pub filter_schemas: Vec<String>,

    /// Adds a stringified `_sdc_lsn` to every LOG_BASED record
    #[serde(default)]
    pub debug_lsn: bool,

    /// Hard wall-clock limit for the LOG_BASED loop
    #[serde(default = "default_max_run_seconds")]
    pub max_run_seconds: u64,
    /// Idle timeout: stop when the WAL stream stays silent this long
    #[serde(default = "default_logical_poll_total_seconds")]
    pub logical_poll_total_seconds: u64,
    /// Stop once a WAL message passes the LSN captured at run start
    #[serde(default = "default_break_at_end_lsn")]
    pub break_at_end_lsn: bool,

    /// Replication slot naming inputs
    #[serde(default)]
    pub tap_id: Option<String>,
    #[serde(default = "default_slot_name_prefix")]
    pub slot_name_prefix: String,
}

impl TapConfig {
    /// Loads and validates a config file.
    pub fn from_file(path: &Path) -> TapResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: TapConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Basic sanity checks before any connection attempt.
    pub fn validate(&self) -> TapResult<()> {
        if self.host.trim().is_empty() {
            return Err(TapError::config("host cannot be empty"));
        }
        if self.dbname.trim().is_empty() {
            return Err(TapError::config("dbname cannot be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(TapError::config("user cannot be empty"));
        }
        if self.secondary_port.is_some() && self.secondary_host.is_none() {
            return Err(TapError::config(
                "secondary_port is set but secondary_host is not",
            ));
        }
        if self.slot_name_prefix.trim().is_empty() {
            return Err(TapError::config("slot_name_prefix cannot be empty"));
        }
        Ok(())
    }

    /// Host and port for read-only query connections
    pub fn query_endpoint(&self) -> (&str, u16) {
        match &self.secondary_host {
            Some(host) => (host.as_str(), self.secondary_port.unwrap_or(self.port)),
            None => (self.host.as_str(), self.port),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "tapdb".to_string(),
            user: "tap".to_string(),
            password: None,
            connect_timeout: 30,
            secondary_host: None,
            secondary_port: None,
            filter_schemas: vec![],
            debug_lsn: false,
            max_run_seconds: 43_200,
            logical_poll_total_seconds: 10_800,
            break_at_end_lsn: true,
            tap_id: None,
            slot_name_prefix: "pipelinewise".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config: TapConfig = serde_json::from_str(
            r#"{"host": "db.internal", "dbname": "orders", "user": "tap"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 5432);
        assert_eq!(config.connect_timeout, 30);
        assert_eq!(config.logical_poll_total_seconds, 10_800);
        assert!(config.break_at_end_lsn);
        assert_eq!(config.slot_name_prefix, "pipelinewise");
        config.validate().unwrap();
    }

    #[test]
    fn rejects_empty_host() {
        let config: TapConfig =
            serde_json::from_str(r#"{"host": " ", "dbname": "orders", "user": "tap"}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_orphan_secondary_port() {
        let mut config = TapConfig::for_tests();
        config.secondary_port = Some(6432);
        assert!(config.validate().is_err());
    }

    #[test]
    fn query_endpoint_prefers_secondary() {
        let mut config = TapConfig::for_tests();
        assert_eq!(config.query_endpoint(), ("localhost", 5432));
        config.secondary_host = Some("replica".to_string());
        assert_eq!(config.query_endpoint(), ("replica", 5432));
        config.secondary_port = Some(6432);
        assert_eq!(config.query_endpoint(), ("replica", 6432));
    }
}
