//! TIME_BASED strategy: fixed-width windows over a timestamp column
//!
//! Walks the replication key from its bookmark (or the table minimum) to the
//! maximum observed at start, one `replication-time-interval` window per
//! SELECT. The window arithmetic and comparisons run on the server so they
//! match PostgreSQL's interval semantics exactly.

use crate::catalog::Stream;
use crate::config::TapConfig;
use crate::db::{self, ConnectionIntent, PgConnection, ServerCursor};
use crate::errors::{TapError, TapResult};
use crate::messages::{Emitter, TapMessage};
use crate::state::{State, UPDATE_BOOKMARK_PERIOD};
use crate::sync::{new_stream_version, now_time_extracted, row_to_record};
use serde_json::Value;
use tracing::{debug, info};

/// Walk one stream window by window up to the max key captured at start.
pub fn sync_table(
    config: &TapConfig,
    stream: &Stream,
    state: &mut State,
    emitter: &mut dyn Emitter,
) -> TapResult<()> {
    let tap_stream_id = stream.tap_stream_id.clone();
    let time_extracted = now_time_extracted();

    let replication_key = stream.replication_key().ok_or_else(|| {
        TapError::config(format!("Stream {} has no replication-key", tap_stream_id))
    })?;
    let time_interval = stream.replication_time_interval().ok_or_else(|| {
        TapError::config(format!(
            "Stream {} has no replication-time-interval",
            tap_stream_id
        ))
    })?;
    let key_sql_datatype = stream.sql_datatype(&replication_key).ok_or_else(|| {
        TapError::config(format!(
            "Unable to find sql-datatype for replication key {} of {}",
            replication_key, tap_stream_id
        ))
    })?;

    let version = state
        .get_i64(&tap_stream_id, "version")
        .unwrap_or_else(new_stream_version);
    state.set(&tap_stream_id, "version", version);
    emitter.emit(&state.to_message()?)?;
    emitter.emit(&TapMessage::ActivateVersion {
        stream: stream.destination_stream_name(),
        version,
    })?;

    let desired_columns = stream.desired_columns();
    if desired_columns.is_empty() {
        return Err(TapError::config(format!(
            "There are no columns selected for stream {}, skipping it",
            tap_stream_id
        )));
    }

    let conn = db::open_connection(config, ConnectionIntent::Query)?;
    let schema_name = stream.schema_name()?;

    let bookmark_value = state
        .get_str(&tap_stream_id, "replication_key_value")
        .map(|s| s.to_string());
    let start_value = match bookmark_value {
        Some(value) => value,
        None => match fetch_bound(&conn, "min", &replication_key, &schema_name, &stream.table_name)? {
            Some(min) => min,
            None => {
                info!("Stream {} is empty, nothing to replicate", tap_stream_id);
                return Ok(());
            }
        },
    };
    let max_value =
        match fetch_bound(&conn, "max", &replication_key, &schema_name, &stream.table_name)? {
            Some(max) => max,
            None => {
                info!("Stream {} is empty, nothing to replicate", tap_stream_id);
                return Ok(());
            }
        };

    info!(
        "Beginning new time-based replication sync {} from {} to {}",
        version, start_value, max_value
    );

    let mut next_value = start_value;
    let mut rows_saved = 0usize;
    let mut last_iteration = false;
    while !last_iteration {
        // The iteration whose window starts past the max still runs once, so
        // the row carrying the max itself is included.
        if server_gt(&conn, &next_value, &max_value, &key_sql_datatype)? {
            last_iteration = true;
        }

        let select_sql = build_window_sql(
            stream,
            &desired_columns,
            &replication_key,
            &key_sql_datatype,
            &next_value,
            &time_interval,
        )?;
        debug!("select statement: {} with itersize {}", select_sql, db::CURSOR_ITER_SIZE);

        let mut cursor = ServerCursor::declare(&conn, "wal2tap_time_based", &select_sql)?;
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
                let record = row_to_record(
                    stream,
                    &desired_columns,
                    &values,
                    version,
                    &time_extracted,
                    &conn,
                )?;
                if let TapMessage::Record { record: fields, .. } = &record {
                    if let Some(key_value) = fields.get(&replication_key) {
                        state.set(&tap_stream_id, "replication_key_value", key_value.clone());
                    }
                }
                emitter.emit(&record)?;

                rows_saved += 1;
                if rows_saved % UPDATE_BOOKMARK_PERIOD == 0 {
                    emitter.emit(&state.to_message()?)?;
                }
            }
        }
        cursor.close()?;

        next_value = fetch_next_window_start(&conn, &next_value, &key_sql_datatype, &time_interval)?;
    }

    info!("Time-based sync of {} emitted {} rows", tap_stream_id, rows_saved);
    Ok(())
}

/// One window: `key >= low AND key < low + interval`
pub fn build_window_sql(
    stream: &Stream,
    desired_columns: &[String],
    replication_key: &str,
    key_sql_datatype: &str,
    window_start: &str,
    time_interval: &str,
) -> TapResult<String> {
    let columns = desired_columns
        .iter()
        .map(|c| db::quote_ident(c))
        .collect::<Vec<_>>()
        .join(",");
    let source = db::fully_qualified_table_name(&stream.schema_name()?, &stream.table_name);
    let key = db::quote_ident(replication_key);
    let low = db::quote_literal(window_start);
    Ok(format!(
        "SELECT {} FROM {} WHERE {} >= {}::{} AND {} < {}::{} + INTERVAL {}",
        columns,
        source,
        key,
        low,
        key_sql_datatype,
        key,
        low,
        key_sql_datatype,
        db::quote_literal(time_interval),
    ))
}

fn fetch_bound(
    conn: &PgConnection,
    aggregate: &str,
    replication_key: &str,
    schema_name: &str,
    table_name: &str,
) -> TapResult<Option<String>> {
    let sql = format!(
        "SELECT {}({}) FROM {}",
        aggregate,
        db::quote_ident(replication_key),
        db::fully_qualified_table_name(schema_name, table_name)
    );
    info!("determine {} replication key value: {}", aggregate, sql);
    let bound = conn.query_scalar(&sql)?;
    info!("{} replication key value: {:?}", aggregate, bound);
    Ok(bound)
}

fn fetch_next_window_start(
    conn: &PgConnection,
    current: &str,
    key_sql_datatype: &str,
    time_interval: &str,
) -> TapResult<String> {
    let sql = format!(
        "SELECT CAST({} as {}) + INTERVAL {}",
        db::quote_literal(current),
        key_sql_datatype,
        db::quote_literal(time_interval)
    );
    debug!("Fetching next replication key after {}", current);
    let next = conn
        .query_scalar(&sql)?
        .ok_or_else(|| TapError::sql("window advance returned NULL"))?;
    info!("next replication key value: {}", next);
    Ok(next)
}

fn server_gt(
    conn: &PgConnection,
    left: &str,
    right: &str,
    key_sql_datatype: &str,
) -> TapResult<bool> {
    let sql = format!(
        "SELECT {}::{} > {}::{}",
        db::quote_literal(left),
        key_sql_datatype,
        db::quote_literal(right),
        key_sql_datatype
    );
    Ok(conn.query_scalar(&sql)?.as_deref() == Some("t"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_stream;

    #[test]
    fn window_bounds_are_half_open() {
        let stream = test_stream();
        let columns = vec!["id".to_string(), "name".to_string()];
        let sql = build_window_sql(
            &stream,
            &columns,
            "timestamp_ntz",
            "timestamp without time zone",
            "2020-09-01 10:40:59",
            "15 MINUTES",
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT \"id\",\"name\" FROM \"public\".\"COW\" \
             WHERE \"timestamp_ntz\" >= '2020-09-01 10:40:59'::timestamp without time zone \
             AND \"timestamp_ntz\" < '2020-09-01 10:40:59'::timestamp without time zone + INTERVAL '15 MINUTES'"
        );
    }
}
