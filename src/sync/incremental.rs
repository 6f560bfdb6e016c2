//! INCREMENTAL strategy: key-range scans above a bookmark
//!
//! Reads `WHERE replication_key >= bookmark ORDER BY replication_key ASC`.
//! The inclusive lower bound re-reads the boundary row after a resume; the
//! downstream dedupes on primary key, so a duplicate beats a gap.

use crate::catalog::Stream;
use crate::config::TapConfig;
use crate::db::{self, ConnectionIntent, ServerCursor};
use crate::errors::{TapError, TapResult};
use crate::messages::{Emitter, TapMessage};
use crate::state::{State, UPDATE_BOOKMARK_PERIOD};
use crate::sync::{new_stream_version, now_time_extracted, row_to_record};
use serde_json::Value;
use tracing::info;

/// Scan one stream from its replication-key bookmark to the end of the table.
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
    state.set(&tap_stream_id, "replication_key", replication_key.clone());
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
    let bookmark_value = state
        .get(&tap_stream_id, "replication_key_value")
        .cloned();
    let select_sql = build_select_sql(
        stream,
        &desired_columns,
        &replication_key,
        &key_sql_datatype,
        bookmark_value.as_ref(),
    )?;
    info!("select statement: {} with itersize {}", select_sql, db::CURSOR_ITER_SIZE);

    let mut rows_saved = 0usize;
    let mut cursor = ServerCursor::declare(&conn, "wal2tap_incremental", &select_sql)?;
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

    info!("Incremental sync of {} emitted {} rows", tap_stream_id, rows_saved);
    Ok(())
}

/// The incremental SELECT; an inclusive lower bound above the bookmark.
pub fn build_select_sql(
    stream: &Stream,
    desired_columns: &[String],
    replication_key: &str,
    key_sql_datatype: &str,
    bookmark_value: Option<&Value>,
) -> TapResult<String> {
    let columns = desired_columns
        .iter()
        .map(|c| db::quote_ident(c))
        .collect::<Vec<_>>()
        .join(",");
    let source = db::fully_qualified_table_name(&stream.schema_name()?, &stream.table_name);
    let key = db::quote_ident(replication_key);
    Ok(match bookmark_value {
        Some(value) => {
            let literal = match value {
                Value::String(s) => db::quote_literal(s),
                other => db::quote_literal(&other.to_string()),
            };
            format!(
                "SELECT {} FROM {} WHERE {} >= {}::{} ORDER BY {} ASC",
                columns, source, key, literal, key_sql_datatype, key
            )
        }
        None => format!("SELECT {} FROM {} ORDER BY {} ASC", columns, source, key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::test_stream;
    use serde_json::json;

    #[test]
    fn first_run_scans_the_whole_table() {
        let stream = test_stream();
        let columns = vec!["id".to_string(), "name".to_string()];
        let sql = build_select_sql(&stream, &columns, "id", "integer", None).unwrap();
        assert_eq!(
            sql,
            "SELECT \"id\",\"name\" FROM \"public\".\"COW\" ORDER BY \"id\" ASC"
        );
    }

    #[test]
    fn resume_uses_inclusive_lower_bound() {
        let stream = test_stream();
        let columns = vec!["id".to_string()];
        let sql = build_select_sql(&stream, &columns, "id", "integer", Some(&json!(42))).unwrap();
        assert!(sql.contains("WHERE \"id\" >= '42'::integer"));
    }

    #[test]
    fn string_bookmarks_are_quoted() {
        let stream = test_stream();
        let columns = vec!["id".to_string()];
        let sql = build_select_sql(
            &stream,
            &columns,
            "name",
            "character varying",
            Some(&json!("o'clock")),
        )
        .unwrap();
        assert!(sql.contains("WHERE \"name\" >= 'o''clock'::character varying"));
    }
}
