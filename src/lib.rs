//! wal2tap - PostgreSQL change-data-capture to the tap message protocol
//!
//! Streams the contents of a PostgreSQL database to stdout as line-delimited
//! JSON messages (SCHEMA, RECORD, STATE, ACTIVATE_VERSION). Each selected
//! table is replicated with one of four strategies:
//!
//! - FULL_TABLE: a snapshot ordered by xmin, resumable mid-table
//! - INCREMENTAL: key-range scans above a persisted bookmark
//! - TIME_BASED: fixed-width window walks over a timestamp column
//! - LOG_BASED: logical replication through a wal2json slot
//!
//! A persisted bookmark state lets every strategy resume exactly where a
//! prior run stopped.

pub mod buffer;
pub mod catalog;
pub mod coerce;
pub mod config;
pub mod db;
pub mod errors;
pub mod messages;
pub mod protocol;
pub mod state;
pub mod sync;
