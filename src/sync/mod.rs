//! Replication strategies and the per-run orchestrator
//!
//! For each selected stream the orchestrator reconciles stale state, picks
//! the strategy named by the stream's metadata and runs it. LOG_BASED streams
//! are batched: any stream that still needs its initial snapshot is
//! bootstrapped first, then every LOG_BASED stream joins a single replication
//! session.

pub mod full_table;
pub mod incremental;
pub mod logical;
pub mod time_based;

use crate::catalog::{Catalog, SchemaRefresher, Stream};
use crate::coerce::{ServerOps, coerce_value};
use crate::config::TapConfig;
use crate::errors::{TapError, TapResult};
use crate::messages::{Emitter, TapMessage};
use crate::state::State;
use chrono::Utc;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

/// Extraction timestamp in the wire format (UTC, microseconds)
pub fn now_time_extracted() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// A fresh stream version: epoch milliseconds
pub fn new_stream_version() -> i64 {
    Utc::now().timestamp_millis()
}

/// Coerces one source row into a RECORD message.
///
/// Column names and values must be positionally aligned; each value runs
/// through the coercion layer using the column's declared sql-datatype.
pub fn row_to_record(
    stream: &Stream,
    columns: &[String],
    values: &[Value],
    version: i64,
    time_extracted: &str,
    server: &dyn ServerOps,
) -> TapResult<TapMessage> {
    debug_assert_eq!(columns.len(), values.len());
    let mut record = Map::new();
    for (idx, column) in columns.iter().enumerate() {
        let sql_datatype = stream.sql_datatype(column).ok_or_else(|| {
            TapError::config(format!(
                "Unable to find sql-datatype for stream {}: {}",
                stream.tap_stream_id, column
            ))
        })?;
        let coerced = coerce_value(&values[idx], &sql_datatype, server)?;
        record.insert(column.clone(), coerced);
    }
    Ok(TapMessage::Record {
        stream: stream.destination_stream_name(),
        record,
        version,
        time_extracted: time_extracted.to_string(),
    })
}

fn emit_state(state: &State, emitter: &mut dyn Emitter) -> TapResult<()> {
    emitter.emit(&state.to_message()?)
}

/// Runs every selected stream once and returns the final state.
pub fn do_sync(
    config: &TapConfig,
    catalog: &Catalog,
    mut state: State,
    state_path: Option<&Path>,
    emitter: &mut dyn Emitter,
    refresher: &dyn SchemaRefresher,
    shutdown: &AtomicBool,
) -> TapResult<State> {
    let mut streams = catalog.selected_streams();
    if streams.is_empty() {
        warn!("No streams selected, nothing to replicate");
        emit_state(&state, emitter)?;
        return Ok(state);
    }

    for stream in &streams {
        let method = required_method(stream)?;
        state.reconcile(
            &stream.tap_stream_id,
            &method,
            stream.replication_key().as_deref(),
        );
    }

    let mut logical_streams: Vec<Stream> = Vec::new();
    for stream in streams.drain(..) {
        let method = required_method(&stream)?;
        match method.as_str() {
            "LOG_BASED" => logical_streams.push(stream),
            "FULL_TABLE" => {
                emitter.emit(&stream.schema_message(vec![]))?;
                state.currently_syncing = Some(stream.tap_stream_id.clone());
                full_table::sync_table(config, &stream, &mut state, emitter)?;
                state.currently_syncing = None;
                emit_state(&state, emitter)?;
            }
            "INCREMENTAL" => {
                let key = required_replication_key(&stream)?;
                emitter.emit(&stream.schema_message(vec![key]))?;
                state.currently_syncing = Some(stream.tap_stream_id.clone());
                incremental::sync_table(config, &stream, &mut state, emitter)?;
                state.currently_syncing = None;
                emit_state(&state, emitter)?;
            }
            "TIME_BASED" => {
                let key = required_replication_key(&stream)?;
                emitter.emit(&stream.schema_message(vec![key]))?;
                state.currently_syncing = Some(stream.tap_stream_id.clone());
                time_based::sync_table(config, &stream, &mut state, emitter)?;
                state.currently_syncing = None;
                emit_state(&state, emitter)?;
            }
            other => {
                return Err(TapError::config(format!(
                    "Stream {} has invalid replication-method {}",
                    stream.tap_stream_id, other
                )));
            }
        }
    }

    if !logical_streams.is_empty() {
        sync_logical(
            config,
            &mut logical_streams,
            &mut state,
            state_path,
            emitter,
            refresher,
            shutdown,
        )?;
    }

    state.currently_syncing = None;
    emit_state(&state, emitter)?;
    Ok(state)
}

/// Bootstraps LOG_BASED streams that need their initial snapshot, then joins
/// them all to one WAL session.
fn sync_logical(
    config: &TapConfig,
    streams: &mut [Stream],
    state: &mut State,
    state_path: Option<&Path>,
    emitter: &mut dyn Emitter,
    refresher: &dyn SchemaRefresher,
    shutdown: &AtomicBool,
) -> TapResult<()> {
    for stream in streams.iter_mut() {
        stream.add_automatic_properties(config.debug_lsn);
    }

    let end_lsn = logical::fetch_current_lsn(config)?;

    for stream in streams.iter() {
        let tap_stream_id = stream.tap_stream_id.clone();
        let has_lsn = state.get_i64(&tap_stream_id, "lsn").is_some();
        let snapshot_in_progress = state.get(&tap_stream_id, "xmin").is_some();
        if has_lsn && !snapshot_in_progress {
            continue;
        }

        // The WAL position is captured before the snapshot so nothing
        // committed during the copy can be missed when streaming starts.
        if !has_lsn {
            info!(
                "Performing initial snapshot of {} before joining the WAL stream",
                tap_stream_id
            );
            state.set(&tap_stream_id, "lsn", end_lsn);
        } else {
            info!("Resuming interrupted initial snapshot of {}", tap_stream_id);
        }

        emitter.emit(&stream.schema_message(vec!["lsn".to_string()]))?;
        state.currently_syncing = Some(tap_stream_id.clone());
        full_table::sync_table(config, stream, state, emitter)?;
        state.currently_syncing = None;
        emit_state(state, emitter)?;
    }

    logical::sync_tables(
        config,
        streams,
        state,
        end_lsn,
        state_path,
        emitter,
        refresher,
        shutdown,
    )
}

fn required_method(stream: &Stream) -> TapResult<String> {
    stream.replication_method().ok_or_else(|| {
        TapError::config(format!(
            "Stream {} has no replication-method",
            stream.tap_stream_id
        ))
    })
}

fn required_replication_key(stream: &Stream) -> TapResult<String> {
    stream.replication_key().ok_or_else(|| {
        TapError::config(format!(
            "Stream {} has no replication-key",
            stream.tap_stream_id
        ))
    })
}
