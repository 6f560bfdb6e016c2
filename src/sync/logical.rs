//! LOG_BASED strategy: logical replication through a wal2json slot
//!
//! One replication session serves every LOG_BASED stream: the server
//! multiplexes their changes into a single WAL stream filtered by
//! `add-tables`, and the client demultiplexes by (schema, table). Flush
//! feedback to PostgreSQL is driven by the committed-state file, never by
//! what this process has merely emitted, so WAL is only discarded once the
//! downstream has durably persisted it.
//!
//! Under `write-in-chunks` a single logical LSN may span several messages, so
//! an LSN is acknowledged only after a higher LSN has been seen.

use crate::catalog::{SchemaRefresher, Stream, compute_tap_stream_id};
use crate::coerce::ServerOps;
use crate::config::TapConfig;
use crate::db::{self, ConnectionIntent, PgConnection};
use crate::errors::{TapError, TapResult};
use crate::messages::Emitter;
use crate::protocol::{StandbyStatusUpdate, StreamMessage};
use crate::state::{State, UPDATE_BOOKMARK_PERIOD};
use crate::sync::{now_time_extracted, row_to_record};
use libpq_sys::ExecStatusType;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Seconds between committed-state re-reads and status updates
const POLL_INTERVAL_SECS: u64 = 10;

/// Session wal_sender_timeout for PostgreSQL 12+, in milliseconds (3 hours)
const WAL_SENDER_TIMEOUT_MS: u64 = 10_800_000;

/// Convert pg_lsn text (`HH/LL`) to its 64-bit integer form
pub fn lsn_to_int(lsn: &str) -> TapResult<i64> {
    let (file, index) = lsn
        .split_once('/')
        .ok_or_else(|| TapError::protocol(format!("Invalid LSN: {}", lsn)))?;
    let file = i64::from_str_radix(file, 16)
        .map_err(|_| TapError::protocol(format!("Invalid LSN: {}", lsn)))?;
    let index = i64::from_str_radix(index, 16)
        .map_err(|_| TapError::protocol(format!("Invalid LSN: {}", lsn)))?;
    Ok((file << 32) + index)
}

/// Convert the 64-bit integer form back to pg_lsn text
pub fn int_to_lsn(lsni: i64) -> String {
    format!("{:X}/{:X}", (lsni >> 32) & 0xFFFF_FFFF, lsni & 0xFFFF_FFFF)
}

/// Current WAL write position, after gating on server version.
///
/// Versions below 9.4 cannot do logical replication at all, and a handful of
/// minor-version bands carry a WAL decoding bug (PostgreSQL BUG #15114) and
/// are rejected outright.
pub fn fetch_current_lsn(config: &TapConfig) -> TapResult<i64> {
    let conn = db::open_connection(config, ConnectionIntent::Query)?;
    let version = db::get_pg_version(&conn)?;

    if (110000..110002).contains(&version) {
        return Err(TapError::config("PostgreSQL upgrade required to minor version 11.2"));
    } else if (100000..100007).contains(&version) {
        return Err(TapError::config("PostgreSQL upgrade required to minor version 10.7"));
    } else if (90600..90612).contains(&version) {
        return Err(TapError::config("PostgreSQL upgrade required to minor version 9.6.12"));
    } else if (90500..90516).contains(&version) {
        return Err(TapError::config("PostgreSQL upgrade required to minor version 9.5.16"));
    } else if (90400..90421).contains(&version) {
        return Err(TapError::config("PostgreSQL upgrade required to minor version 9.4.21"));
    } else if version < 90400 {
        return Err(TapError::config(
            "Logical replication not supported before PostgreSQL 9.4",
        ));
    }

    let sql = if version >= 100000 {
        "SELECT pg_current_wal_lsn() AS current_lsn"
    } else {
        "SELECT pg_current_xlog_location() AS current_lsn"
    };
    let current_lsn = conn
        .query_scalar(sql)?
        .ok_or_else(|| TapError::sql("current WAL position not reported"))?;
    lsn_to_int(&current_lsn)
}

/// Replication slot name: `{prefix}_{dbname}[_{tap_id}]`, lowercased,
/// non `[a-z0-9_]` characters replaced with underscores, at most 64 bytes.
pub fn generate_slot_name(dbname: &str, tap_id: Option<&str>, prefix: &str) -> String {
    let raw = match tap_id {
        Some(tap_id) => format!("{}_{}_{}", prefix, dbname, tap_id),
        None => format!("{}_{}", prefix, dbname),
    };
    let mut sanitized: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    sanitized.truncate(64);
    sanitized
}

/// Finds the replication slot to stream from.
///
/// Prefers the tap-specific name, falls back to the database-wide one; the
/// slot must exist and carry the wal2json plugin.
pub fn locate_slot(
    conn: &PgConnection,
    dbname: &str,
    tap_id: Option<&str>,
    prefix: &str,
) -> TapResult<String> {
    let mut candidates = Vec::new();
    if tap_id.is_some() {
        candidates.push(generate_slot_name(dbname, tap_id, prefix));
    }
    let db_wide = generate_slot_name(dbname, None, prefix);
    if !candidates.contains(&db_wide) {
        candidates.push(db_wide);
    }

    for slot_name in &candidates {
        let sql = format!(
            "SELECT slot_name FROM pg_replication_slots WHERE slot_name = {} AND plugin = 'wal2json'",
            db::quote_literal(slot_name)
        );
        if conn.exec(&sql)?.ntuples() == 1 {
            info!("Using pg_replication_slot {}", slot_name);
            return Ok(slot_name.clone());
        }
    }
    Err(TapError::ReplicationSlotNotFound {
        candidates: candidates.join(", "),
    })
}

/// wal2json `add-tables` filter: `{schema}.{table}` entries joined by commas,
/// with space, comma and single quote backslash-escaped inside identifiers.
pub fn streams_to_wal2json_tables(streams: &[Stream]) -> TapResult<String> {
    let mut entries = Vec::with_capacity(streams.len());
    for stream in streams {
        entries.push(format!(
            "{}.{}",
            escape_wal2json_ident(&stream.schema_name()?),
            escape_wal2json_ident(&stream.table_name)
        ));
    }
    Ok(entries.join(","))
}

fn escape_wal2json_ident(ident: &str) -> String {
    let mut escaped = String::with_capacity(ident.len());
    for c in ident.chars() {
        if c == ' ' || c == ',' || c == '\'' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Translates one wal2json change event into a RECORD and advances the
/// stream's lsn bookmark.
///
/// Payloads that are not complete JSON documents are chunk continuations and
/// are skipped, as are events for tables outside the stream set. New columns
/// in a payload trigger a schema refresh and a fresh SCHEMA message before
/// the RECORD.
#[allow(clippy::too_many_arguments)]
pub fn consume_message(
    streams: &mut [Stream],
    state: &mut State,
    payload: &[u8],
    data_start: i64,
    time_extracted: &str,
    config: &TapConfig,
    refresher: &dyn SchemaRefresher,
    server: &dyn ServerOps,
    emitter: &mut dyn Emitter,
) -> TapResult<()> {
    // write-in-chunks prefixes continuations with a comma and splits JSON
    // documents across messages; anything unparseable is such a fragment
    let text = String::from_utf8_lossy(payload);
    let payload: Value = match serde_json::from_str(text.trim_start_matches(',')) {
        Ok(value) => value,
        Err(_) => return Ok(()),
    };

    let (Some(schema_name), Some(table_name)) =
        (payload["schema"].as_str(), payload["table"].as_str())
    else {
        return Ok(());
    };
    let tap_stream_id = compute_tap_stream_id(schema_name, table_name);
    let Some(position) = streams
        .iter()
        .position(|s| s.tap_stream_id == tap_stream_id)
    else {
        return Ok(());
    };

    let kind = payload["kind"].as_str().unwrap_or_default();
    if !matches!(kind, "insert" | "update" | "delete") {
        return Err(TapError::UnsupportedPayloadKind {
            kind: kind.to_string(),
        });
    }

    // Schema drift: a payload naming columns the stream does not know means
    // the table changed under us; refresh and re-announce before the RECORD.
    if kind != "delete" {
        let known = streams[position].known_columns();
        let has_new_columns = payload["columnnames"]
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str())
                    .any(|n| !known.contains(n))
            })
            .unwrap_or(false);
        if has_new_columns {
            info!("Detected new columns in {}, refreshing its schema", tap_stream_id);
            refresher.refresh(&mut streams[position..=position])?;
            emitter.emit(&streams[position].schema_message(vec!["lsn".to_string()]))?;
        }
    }

    let stream = &streams[position];
    let stream_version = state.get_i64(&tap_stream_id, "version").ok_or_else(|| {
        TapError::config(format!("version not found for stream {}", tap_stream_id))
    })?;
    let desired: std::collections::HashSet<String> =
        stream.desired_columns().into_iter().collect();

    let mut col_names: Vec<String> = Vec::new();
    let mut col_vals: Vec<Value> = Vec::new();

    match kind {
        "insert" => {
            collect_selected(&payload["columnnames"], &payload["columnvalues"], &desired, &mut col_names, &mut col_vals);
            col_names.push("_sdc_deleted_at".to_string());
            col_vals.push(Value::Null);
            if config.debug_lsn {
                col_names.push("_sdc_lsn".to_string());
                col_vals.push(Value::String(data_start.to_string()));
            }
        }
        "update" => {
            collect_selected(&payload["columnnames"], &payload["columnvalues"], &desired, &mut col_names, &mut col_vals);
            col_names.push("_sdc_deleted_at".to_string());
            col_vals.push(Value::Null);
            if config.debug_lsn {
                col_names.push("_sdc_lsn".to_string());
                col_vals.push(Value::String(data_start.to_string()));
            }
        }
        "delete" => {
            let oldkeys = &payload["oldkeys"];
            collect_selected(&oldkeys["keynames"], &oldkeys["keyvalues"], &desired, &mut col_names, &mut col_vals);
            col_names.push("_sdc_deleted_at".to_string());
            col_vals.push(Value::String(time_extracted.to_string()));
            if config.debug_lsn {
                col_names.push("_sdc_lsn".to_string());
                col_vals.push(Value::String(data_start.to_string()));
            }
        }
        _ => unreachable!("kind validated above"),
    }

    let record = row_to_record(
        stream,
        &col_names,
        &col_vals,
        stream_version,
        time_extracted,
        server,
    )?;
    emitter.emit(&record)?;
    state.set(&tap_stream_id, "lsn", data_start);
    Ok(())
}

fn collect_selected(
    names: &Value,
    values: &Value,
    desired: &std::collections::HashSet<String>,
    col_names: &mut Vec<String>,
    col_vals: &mut Vec<Value>,
) {
    let names = names.as_array().cloned().unwrap_or_default();
    let values = values.as_array().cloned().unwrap_or_default();
    for (idx, name) in names.iter().enumerate() {
        let Some(name) = name.as_str() else { continue };
        if desired.contains(name) {
            col_names.push(name.to_string());
            col_vals.push(values.get(idx).cloned().unwrap_or(Value::Null));
        }
    }
}

/// Streams every LOG_BASED stream through one replication session.
///
/// The loop never flushes PostgreSQL past what the committed-state file
/// proves the downstream has persisted, and never past the second-newest LSN
/// seen on the wire (chunked payloads make the newest one unprovably
/// complete).
#[allow(clippy::too_many_arguments)]
pub fn sync_tables(
    config: &TapConfig,
    streams: &mut [Stream],
    state: &mut State,
    end_lsn: i64,
    state_path: Option<&Path>,
    emitter: &mut dyn Emitter,
    refresher: &dyn SchemaRefresher,
    shutdown: &AtomicBool,
) -> TapResult<()> {
    let time_extracted = now_time_extracted();

    let mut committed_state = state.clone();
    let mut lsn_committed = min_logical_lsn(&committed_state, streams).ok_or_else(|| {
        TapError::config("A LOG_BASED stream has no lsn bookmark after bootstrap")
    })?;
    let start_lsn = lsn_committed;
    let mut lsn_to_flush: Option<i64> = None;
    let mut lsn_last_processed: Option<i64> = None;
    let mut lsn_currently_processing: Option<i64> = None;
    let mut lsn_processed_count = 0usize;
    let mut lsn_received_timestamp = Instant::now();
    let mut poll_timestamp = Instant::now();
    let start_run_timestamp = Instant::now();

    let max_run = Duration::from_secs(config.max_run_seconds);
    let poll_total = Duration::from_secs(config.logical_poll_total_seconds);
    let poll_interval = Duration::from_secs(POLL_INTERVAL_SECS);

    let query_conn = db::open_connection(config, ConnectionIntent::Query)?;
    let slot = locate_slot(
        &query_conn,
        &config.dbname,
        config.tap_id.as_deref(),
        &config.slot_name_prefix,
    )?;
    let selected_tables = streams_to_wal2json_tables(streams)?;

    for stream in streams.iter() {
        emitter.emit(&stream.schema_message(vec!["lsn".to_string()]))?;
    }

    let version = db::get_pg_version(&query_conn)?;
    let replication_conn = db::open_connection(config, ConnectionIntent::Replication)?;

    if version >= 120000 {
        info!("Set session wal_sender_timeout = {} milliseconds", WAL_SENDER_TIMEOUT_MS);
        replication_conn.exec(&format!(
            "SET SESSION wal_sender_timeout = {}",
            WAL_SENDER_TIMEOUT_MS
        ))?;
    }

    info!(
        "Request wal streaming from {} to {} (slot {})",
        int_to_lsn(start_lsn),
        int_to_lsn(end_lsn),
        slot
    );
    let start_replication = format!(
        "START_REPLICATION SLOT {} LOGICAL {} (\"write-in-chunks\" '1', \"add-tables\" {})",
        db::quote_ident(&slot),
        int_to_lsn(start_lsn),
        db::quote_literal(&selected_tables)
    );
    let result = replication_conn.exec(&start_replication)?;
    if result.status() != ExecStatusType::PGRES_COPY_BOTH {
        return Err(TapError::protocol(format!(
            "Unable to start replication with logical replication (slot {})",
            slot
        )));
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            info!("Breaking - shutdown signal received");
            break;
        }
        let idle = lsn_received_timestamp.elapsed();
        if idle > poll_total {
            info!("Breaking - {} seconds of polling with no data", idle.as_secs());
            break;
        }
        if start_run_timestamp.elapsed() >= max_run {
            info!("Breaking - reached max_run_seconds of {}", config.max_run_seconds);
            break;
        }

        match replication_conn.get_copy_data()? {
            None => {
                replication_conn.wait_readable(Duration::from_millis(100))?;
            }
            Some(raw) => match StreamMessage::parse(&raw)? {
                StreamMessage::Keepalive(keepalive) => {
                    if keepalive.reply_requested {
                        debug!("Server requested feedback in keepalive");
                        send_feedback(&replication_conn, lsn_to_flush.unwrap_or(0))?;
                    }
                }
                StreamMessage::XLogData(xlog) => {
                    let data_start = xlog.data_start as i64;
                    if config.break_at_end_lsn && data_start > end_lsn {
                        info!(
                            "Breaking - latest wal message {} is past end_lsn {}",
                            int_to_lsn(data_start),
                            int_to_lsn(end_lsn)
                        );
                        break;
                    }

                    consume_message(
                        streams,
                        state,
                        &xlog.data,
                        data_start,
                        &time_extracted,
                        config,
                        refresher,
                        &query_conn,
                        emitter,
                    )?;

                    if lsn_currently_processing.is_none() {
                        lsn_currently_processing = Some(data_start);
                        info!("First wal message received is {}", int_to_lsn(data_start));

                        // Flush up to whatever was committed in the previous
                        // run, or this run's first LSN, whichever is older
                        let flush = lsn_committed.min(data_start);
                        lsn_to_flush = Some(flush);
                        info!(
                            "Confirming write up to {}, flush to {}",
                            int_to_lsn(flush),
                            int_to_lsn(flush)
                        );
                        send_feedback(&replication_conn, flush)?;
                    } else if data_start > lsn_currently_processing.unwrap_or(0) {
                        lsn_last_processed = lsn_currently_processing;
                        lsn_currently_processing = Some(data_start);
                        lsn_received_timestamp = Instant::now();
                        lsn_processed_count += 1;
                        if lsn_processed_count >= UPDATE_BOOKMARK_PERIOD {
                            if let Some(last) = lsn_last_processed {
                                debug!(
                                    "Updating bookmarks for all streams to lsn = {} ({})",
                                    last,
                                    int_to_lsn(last)
                                );
                                for stream in streams.iter() {
                                    state.set(&stream.tap_stream_id, "lsn", last);
                                }
                                emitter.emit(&state.to_message()?)?;
                            }
                            lsn_processed_count = 0;
                        }
                    }
                }
            },
        }

        // Every poll interval, learn how far the downstream has durably
        // persisted and move the server's flush horizon accordingly
        if poll_timestamp.elapsed() >= poll_interval {
            match lsn_currently_processing {
                None => info!("Waiting for first wal message"),
                Some(current) => {
                    info!(
                        "Latest wal message received was {}",
                        lsn_last_processed.map(int_to_lsn).unwrap_or_else(|| "none".to_string())
                    );
                    if let Some(path) = state_path {
                        if let Some(fresh) = State::read_committed(path) {
                            committed_state = fresh;
                        }
                    }
                    if let Some(committed) = min_logical_lsn(&committed_state, streams) {
                        lsn_committed = committed;
                        if current > lsn_committed && lsn_committed > lsn_to_flush.unwrap_or(0) {
                            lsn_to_flush = Some(lsn_committed);
                            info!(
                                "Confirming write up to {}, flush to {}",
                                int_to_lsn(lsn_committed),
                                int_to_lsn(lsn_committed)
                            );
                            send_feedback(&replication_conn, lsn_committed)?;
                        }
                    }
                }
            }
            poll_timestamp = Instant::now();
        }
    }

    drop(replication_conn);

    if let Some(mut last) = lsn_last_processed {
        if lsn_committed > last {
            info!(
                "Current lsn_last_processed {} is older than lsn_comitted {}",
                int_to_lsn(last),
                int_to_lsn(lsn_committed)
            );
            last = lsn_committed;
        }
        info!(
            "Updating bookmarks for all streams to lsn = {} ({})",
            last,
            int_to_lsn(last)
        );
        for stream in streams.iter() {
            state.set(&stream.tap_stream_id, "lsn", last);
        }
    }

    emitter.emit(&state.to_message()?)?;
    Ok(())
}

fn send_feedback(conn: &PgConnection, flush_lsn: i64) -> TapResult<()> {
    let update = StandbyStatusUpdate {
        write_lsn: flush_lsn as u64,
        flush_lsn: flush_lsn as u64,
        apply_lsn: 0,
        reply_requested: false,
    };
    conn.put_copy_data(&update.encode()?)?;
    conn.flush()?;
    debug!("Sent feedback with flush LSN {}", int_to_lsn(flush_lsn));
    Ok(())
}

fn min_logical_lsn(state: &State, streams: &[Stream]) -> Option<i64> {
    streams
        .iter()
        .filter_map(|s| state.get_i64(&s.tap_stream_id, "lsn"))
        .min()
}
