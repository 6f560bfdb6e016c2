//! FULL_TABLE strategy: a resumable table snapshot
//!
//! The whole table is read in one SELECT ordered by `xmin::text::bigint`, a
//! stable cursor that survives interruption: the bookmark records the last
//! emitted row's xmin and a restart resumes from `xmin >= bookmark` under the
//! same stream version. Only after the snapshot completes is the version
//! activated again and the xmin bookmark cleared.

use crate::catalog::Stream;
use crate::config::TapConfig;
use crate::db::{self, ConnectionIntent, ServerCursor};
use crate::errors::{TapError, TapResult};
use crate::messages::{Emitter, TapMessage};
use crate::state::{State, UPDATE_BOOKMARK_PERIOD};
use crate::sync::{new_stream_version, now_time_extracted, row_to_record};
use serde_json::Value;
use tracing::info;

/// Snapshot one stream, resuming from the xmin bookmark when present.
pub fn sync_table(
    config: &TapConfig,
    stream: &Stream,
    state: &mut State,
    emitter: &mut dyn Emitter,
) -> TapResult<()> {
    let tap_stream_id = stream.tap_stream_id.clone();
    let time_extracted = now_time_extracted();

    // An interrupted run keeps its version so the downstream never sees a
    // half-replaced generation.
    let version = state
        .get_i64(&tap_stream_id, "version")
        .unwrap_or_else(new_stream_version);
    state.set(&tap_stream_id, "version", version);
    emitter.emit(&state.to_message()?)?;

    let desired_columns = stream.desired_columns();
    if desired_columns.is_empty() {
        return Err(TapError::config(format!(
            "There are no columns selected for stream {}, skipping it",
            tap_stream_id
        )));
    }

    let conn = db::open_connection(config, ConnectionIntent::Query)?;
    log_encodings(&conn)?;
    if db::hstore_available(&conn)? {
        info!("hstore is available");
    } else {
        info!("hstore is UNavailable");
    }

    let xmin_bookmark = state.get_i64(&tap_stream_id, "xmin");
    if xmin_bookmark.is_none() {
        emitter.emit(&TapMessage::ActivateVersion {
            stream: stream.destination_stream_name(),
            version,
        })?;
    }

    let select_sql = build_select_sql(stream, &desired_columns, xmin_bookmark)?;
    info!("select statement: {} with itersize {}", select_sql, db::CURSOR_ITER_SIZE);

    let mut rows_saved = 0usize;
    let mut cursor = ServerCursor::declare(&conn, "wal2tap_full_table", &select_sql)?;
    while let Some(batch) = cursor.next_batch()? {
        for row in 0..batch.ntuples() {
            let values: Vec<Value> = (0..desired_columns.len() as i32)
                .map(|col| {
                    batch
                        .getvalue(row, col)
                        .map(Value::String)
                        .unwrap_or(Value::Null)
                })
                .collect();
            let xmin_column = desired_columns.len() as i32;
            let row_xmin: i64 = batch
                .getvalue(row, xmin_column)
                .and_then(|x| x.parse().ok())
                .ok_or_else(|| TapError::sql("snapshot row is missing its xmin"))?;

            let record = row_to_record(
                stream,
                &desired_columns,
                &values,
                version,
                &time_extracted,
                &conn,
            )?;
            emitter.emit(&record)?;
            state.set(&tap_stream_id, "xmin", row_xmin);

            rows_saved += 1;
            if rows_saved % UPDATE_BOOKMARK_PERIOD == 0 {
                emitter.emit(&state.to_message()?)?;
            }
        }
    }
    cursor.close()?;

    info!("Snapshot of {} complete after {} rows", tap_stream_id, rows_saved);
    state.clear_key(&tap_stream_id, "xmin");
    emitter.emit(&TapMessage::ActivateVersion {
        stream: stream.destination_stream_name(),
        version,
    })?;
    Ok(())
}

/// The snapshot SELECT: selected columns plus the xmin cursor column, ordered
/// by xmin, optionally resuming above a bookmark.
pub fn build_select_sql(
    stream: &Stream,
    desired_columns: &[String],
    xmin_bookmark: Option<i64>,
) -> TapResult<String> {
    let columns = desired_columns
        .iter()
        .map(|c| db::quote_ident(c))
        .collect::<Vec<_>>()
        .join(",");
    let source = db::fully_qualified_table_name(&stream.schema_name()?, &stream.table_name);
    Ok(match xmin_bookmark {
        Some(xmin) => format!(
            "SELECT {},xmin::text::bigint FROM {} WHERE xmin::text::bigint >= {} ORDER BY xmin::text::bigint ASC",
            columns, source, xmin
        ),
        None => format!(
            "SELECT {},xmin::text::bigint FROM {} ORDER BY xmin::text::bigint ASC",
            columns, source
        ),
    })
}

fn log_encodings(conn: &db::PgConnection) -> TapResult<()> {
    if let Some(encoding) = conn.query_scalar("show server_encoding")? {
        info!("Current Server Encoding: {}", encoding);
    }
    if let Some(encoding) = conn.query_scalar("show client_encoding")? {
        info!("Current Client Encoding: {}", encoding);
    }
    Ok(())
}
