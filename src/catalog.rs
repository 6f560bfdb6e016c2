//! Stream catalog structures
//!
//! A catalog file lists the streams (tables) the tap may replicate. Each
//! stream carries a JSON Schema for its row shape plus a metadata tree keyed
//! by breadcrumb: the empty breadcrumb holds table-level keys (replication
//! method, key, selection), `["properties", <column>]` holds column-level
//! keys (sql-datatype, inclusion, selection).

use crate::config::TapConfig;
use crate::db::{self, ConnectionIntent};
use crate::errors::{TapError, TapResult};
use crate::messages::TapMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use tracing::{debug, info};

/// Canonical stream identifier: `{schema}-{table}`
pub fn compute_tap_stream_id(schema_name: &str, table_name: &str) -> String {
    format!("{}-{}", schema_name, table_name)
}

/// One node of the stream metadata tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// One table selected for extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub tap_stream_id: String,
    pub table_name: String,
    #[serde(default)]
    pub stream: String,
    pub schema: Value,
    pub metadata: Vec<MetadataEntry>,
}

/// The whole catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<Stream>,
}

impl Catalog {
    pub fn from_file(path: &std::path::Path) -> TapResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let catalog: Catalog = serde_json::from_str(&raw)?;
        Ok(catalog)
    }

    /// Streams whose table-level metadata marks them selected
    pub fn selected_streams(&self) -> Vec<Stream> {
        self.streams
            .iter()
            .filter(|s| s.is_selected())
            .cloned()
            .collect()
    }
}

impl Stream {
    /// Table-level metadata map (empty breadcrumb)
    pub fn table_metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata
            .iter()
            .find(|e| e.breadcrumb.is_empty())
            .map(|e| &e.metadata)
    }

    /// Column-level metadata map (`["properties", column]` breadcrumb)
    pub fn column_metadata(&self, column: &str) -> Option<&Map<String, Value>> {
        self.metadata
            .iter()
            .find(|e| {
                e.breadcrumb.len() == 2
                    && e.breadcrumb[0] == "properties"
                    && e.breadcrumb[1] == column
            })
            .map(|e| &e.metadata)
    }

    fn table_meta_str(&self, key: &str) -> Option<String> {
        self.table_metadata()
            .and_then(|m| m.get(key))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    pub fn schema_name(&self) -> TapResult<String> {
        self.table_meta_str("schema-name").ok_or_else(|| {
            TapError::config(format!("Stream {} has no schema-name", self.tap_stream_id))
        })
    }

    pub fn database_name(&self) -> Option<String> {
        self.table_meta_str("database-name")
    }

    pub fn replication_method(&self) -> Option<String> {
        self.table_meta_str("replication-method")
    }

    pub fn replication_key(&self) -> Option<String> {
        self.table_meta_str("replication-key")
    }

    pub fn replication_time_interval(&self) -> Option<String> {
        self.table_meta_str("replication-time-interval")
    }

    pub fn is_view(&self) -> bool {
        self.table_metadata()
            .and_then(|m| m.get("is-view"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn is_selected(&self) -> bool {
        self.table_metadata()
            .and_then(|m| m.get("selected"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Primary key columns from `table-key-properties`
    pub fn key_properties(&self) -> Vec<String> {
        self.table_metadata()
            .and_then(|m| m.get("table-key-properties"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stream name the downstream sees: `{schema}-{stream}`
    pub fn destination_stream_name(&self) -> String {
        let stream = if self.stream.is_empty() {
            &self.table_name
        } else {
            &self.stream
        };
        match self.table_meta_str("schema-name") {
            Some(schema) => format!("{}-{}", schema, stream),
            None => stream.clone(),
        }
    }

    /// Whether a column's values are emitted.
    ///
    /// `inclusion: automatic` always syncs, `unsupported` never does; between
    /// those an explicit `selected` wins, then `selected-by-default`.
    pub fn should_sync_column(&self, column: &str) -> bool {
        let Some(md) = self.column_metadata(column) else {
            return false;
        };
        match md.get("inclusion").and_then(|v| v.as_str()) {
            Some("automatic") => return true,
            Some("unsupported") => return false,
            _ => {}
        }
        if let Some(selected) = md.get("selected").and_then(|v| v.as_bool()) {
            return selected;
        }
        md.get("selected-by-default")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Selected column names in schema property order
    pub fn desired_columns(&self) -> Vec<String> {
        self.schema_properties()
            .map(|props| {
                props
                    .keys()
                    .filter(|c| self.should_sync_column(c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All property names the schema currently knows
    pub fn known_columns(&self) -> HashSet<String> {
        self.schema_properties()
            .map(|props| props.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn schema_properties(&self) -> Option<&Map<String, Value>> {
        self.schema.get("properties").and_then(|p| p.as_object())
    }

    fn schema_properties_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.schema
            .as_object_mut()
            .and_then(|o| o.get_mut("properties"))
            .and_then(|p| p.as_object_mut())
    }

    /// Declared sql-datatype of a column
    pub fn sql_datatype(&self, column: &str) -> Option<String> {
        match column {
            "_sdc_deleted_at" => return Some("timestamp with time zone".to_string()),
            "_sdc_lsn" => return Some("character varying".to_string()),
            _ => {}
        }
        self.column_metadata(column)
            .and_then(|m| m.get("sql-datatype"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// SCHEMA message for this stream
    pub fn schema_message(&self, bookmark_properties: Vec<String>) -> TapMessage {
        TapMessage::Schema {
            stream: self.destination_stream_name(),
            schema: self.schema.clone(),
            key_properties: self.key_properties(),
            bookmark_properties,
        }
    }

    /// Adds the synthetic change-tracking properties every LOG_BASED stream
    /// carries: `_sdc_deleted_at`, and `_sdc_lsn` when debug_lsn is on.
    pub fn add_automatic_properties(&mut self, debug_lsn: bool) {
        if let Some(props) = self.schema_properties_mut() {
            props.insert(
                "_sdc_deleted_at".to_string(),
                json!({"type": ["null", "string"], "format": "date-time"}),
            );
            if debug_lsn {
                debug!("debug_lsn is ON");
                props.insert("_sdc_lsn".to_string(), json!({"type": ["null", "string"]}));
            } else {
                debug!("debug_lsn is OFF");
            }
        }
    }
}

/// Collaborator invoked when a WAL payload references columns the stream's
/// schema does not know yet
pub trait SchemaRefresher {
    fn refresh(&self, streams: &mut [Stream]) -> TapResult<()>;
}

/// Refreshes stream schemas from information_schema.
///
/// Newly discovered columns are appended to the stream's JSON Schema and
/// metadata; existing entries (including non-discoverable keys like
/// replication method and selection) are left untouched.
pub struct InformationSchemaRefresher {
    config: TapConfig,
}

impl InformationSchemaRefresher {
    pub fn new(config: TapConfig) -> Self {
        Self { config }
    }
}

impl SchemaRefresher for InformationSchemaRefresher {
    fn refresh(&self, streams: &mut [Stream]) -> TapResult<()> {
        debug!("Refreshing streams schemas ...");
        let conn = db::open_connection(&self.config, ConnectionIntent::Query)?;

        for stream in streams.iter_mut() {
            let schema_name = stream.schema_name()?;
            if !self.config.filter_schemas.is_empty()
                && !self.config.filter_schemas.contains(&schema_name)
            {
                debug!("Schema {} is filtered out, not refreshing {}", schema_name, stream.tap_stream_id);
                continue;
            }
            let sql = format!(
                "SELECT column_name, data_type, is_nullable, character_maximum_length \
                 FROM information_schema.columns \
                 WHERE table_schema = {} AND table_name = {} \
                 ORDER BY ordinal_position",
                db::quote_literal(&schema_name),
                db::quote_literal(&stream.table_name),
            );
            let result = conn.exec(&sql)?;

            let known = stream.known_columns();
            for row in 0..result.ntuples() {
                let column = result
                    .getvalue(row, 0)
                    .ok_or_else(|| TapError::sql("information_schema returned a null column"))?;
                if known.contains(&column) {
                    continue;
                }
                let data_type = result.getvalue(row, 1).unwrap_or_default();
                let nullable = result.getvalue(row, 2).as_deref() == Some("YES");
                let max_length = result
                    .getvalue(row, 3)
                    .and_then(|l| l.parse::<i64>().ok());

                info!(
                    "Adding newly discovered column {} ({}) to stream {}",
                    column, data_type, stream.tap_stream_id
                );
                let property = schema_for_sql_datatype(&data_type, nullable, max_length);
                if let Some(props) = stream.schema_properties_mut() {
                    props.insert(column.clone(), property);
                }
                stream.metadata.push(MetadataEntry {
                    breadcrumb: vec!["properties".to_string(), column],
                    metadata: json!({
                        "sql-datatype": data_type,
                        "inclusion": "available",
                        "selected-by-default": true,
                    })
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
                });
            }
        }
        Ok(())
    }
}

/// JSON Schema for one column datatype
pub fn schema_for_sql_datatype(sql_datatype: &str, nullable: bool, max_length: Option<i64>) -> Value {
    let base = sql_datatype.trim_end_matches("[]");
    let mut schema = match base {
        "smallint" => json!({"type": "integer", "minimum": -32768, "maximum": 32767}),
        "integer" => json!({"type": "integer", "minimum": -2147483648i64, "maximum": 2147483647i64}),
        "bigint" => json!({
            "type": "integer",
            "minimum": i64::MIN,
            "maximum": i64::MAX
        }),
        "real" | "double precision" => json!({"type": "number"}),
        "numeric" => json!({"type": "number"}),
        "boolean" | "bit" => json!({"type": "boolean"}),
        "json" | "jsonb" => json!({"type": ["object", "array", "string", "number", "boolean", "null"]}),
        "date" | "timestamp without time zone" | "timestamp with time zone" => {
            json!({"type": "string", "format": "date-time"})
        }
        "time without time zone" | "time with time zone" => {
            json!({"type": "string", "format": "time"})
        }
        _ => match max_length {
            Some(len) => json!({"type": "string", "maxLength": len}),
            None => json!({"type": "string"}),
        },
    };

    if nullable {
        if let Some(obj) = schema.as_object_mut() {
            let existing = obj.get("type").cloned().unwrap_or(Value::Null);
            let mut types = vec![Value::String("null".to_string())];
            match existing {
                Value::String(s) => types.push(Value::String(s)),
                Value::Array(a) => types.extend(a.into_iter().filter(|t| t != "null")),
                _ => {}
            }
            obj.insert("type".to_string(), Value::Array(types));
        }
    }
    if sql_datatype.ends_with("[]") {
        return json!({"type": ["null", "array"], "items": schema});
    }
    schema
}
