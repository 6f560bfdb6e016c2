//! Tap protocol messages and emitters
//!
//! The downstream consumer reads one JSON object per line: SCHEMA describes a
//! stream, RECORD carries a row, STATE snapshots every bookmark, and
//! ACTIVATE_VERSION tells the consumer a new snapshot generation replaces any
//! prior one. Strategies never print directly; they write through an
//! [`Emitter`] so tests can capture the message sequence and inject faults.

use crate::errors::{TapError, TapResult};
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::Write;

/// One wire message of the tap protocol
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TapMessage {
    #[serde(rename = "SCHEMA")]
    Schema {
        stream: String,
        schema: Value,
        key_properties: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        bookmark_properties: Vec<String>,
    },
    #[serde(rename = "RECORD")]
    Record {
        stream: String,
        record: Map<String, Value>,
        version: i64,
        time_extracted: String,
    },
    #[serde(rename = "STATE")]
    State { value: Value },
    #[serde(rename = "ACTIVATE_VERSION")]
    ActivateVersion { stream: String, version: i64 },
}

impl TapMessage {
    /// Message kind for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            TapMessage::Schema { .. } => "SCHEMA",
            TapMessage::Record { .. } => "RECORD",
            TapMessage::State { .. } => "STATE",
            TapMessage::ActivateVersion { .. } => "ACTIVATE_VERSION",
        }
    }
}

/// Sequential output sink for tap messages
pub trait Emitter {
    fn emit(&mut self, message: &TapMessage) -> TapResult<()>;
}

/// Line-delimited JSON on stdout, flushed per message so a downstream pipe
/// never sees a torn line after a crash
pub struct StdoutEmitter;

impl Emitter for StdoutEmitter {
    fn emit(&mut self, message: &TapMessage) -> TapResult<()> {
        let line = serde_json::to_string(message)?;
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        writeln!(handle, "{}", line)?;
        handle.flush()?;
        Ok(())
    }
}

/// Emitter that records every message in memory.
///
/// An optional record limit makes it throw partway through a stream, which is
/// how interruption and resume behavior is exercised without a real
/// downstream writer.
#[derive(Default)]
pub struct CapturingEmitter {
    pub messages: Vec<TapMessage>,
    record_limit: Option<(String, usize)>,
    records_seen: usize,
}

impl CapturingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with an error once more than `limit` RECORDs for `stream` have
    /// been accepted.
    pub fn with_record_limit<S: Into<String>>(stream: S, limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            record_limit: Some((stream.into(), limit)),
            records_seen: 0,
        }
    }

    /// The streams of all captured RECORD messages, in order
    pub fn record_streams(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                TapMessage::Record { stream, .. } => Some(stream.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl Emitter for CapturingEmitter {
    fn emit(&mut self, message: &TapMessage) -> TapResult<()> {
        if let TapMessage::Record { stream, .. } = message {
            if let Some((limited_stream, limit)) = &self.record_limit {
                if stream == limited_stream {
                    self.records_seen += 1;
                    if self.records_seen > *limit {
                        return Err(TapError::protocol("simulated downstream write failure"));
                    }
                }
            }
        }
        self.messages.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_type_tag() {
        let message = TapMessage::ActivateVersion {
            stream: "public-COW".to_string(),
            version: 1598000000000,
        };
        let line = serde_json::to_string(&message).unwrap();
        assert_eq!(
            line,
            "{\"type\":\"ACTIVATE_VERSION\",\"stream\":\"public-COW\",\"version\":1598000000000}"
        );
    }

    #[test]
    fn schema_omits_empty_bookmark_properties() {
        let message = TapMessage::Schema {
            stream: "public-COW".to_string(),
            schema: json!({"type": "object"}),
            key_properties: vec!["id".to_string()],
            bookmark_properties: vec![],
        };
        let line = serde_json::to_string(&message).unwrap();
        assert!(!line.contains("bookmark_properties"));
    }

    #[test]
    fn capturing_emitter_faults_after_limit() {
        let mut emitter = CapturingEmitter::with_record_limit("public-COW", 2);
        let record = TapMessage::Record {
            stream: "public-COW".to_string(),
            record: Map::new(),
            version: 1,
            time_extracted: "2020-09-01T00:00:00.000000Z".to_string(),
        };
        assert!(emitter.emit(&record).is_ok());
        assert!(emitter.emit(&record).is_ok());
        assert!(emitter.emit(&record).is_err());
        assert_eq!(emitter.messages.len(), 2);
    }

    #[test]
    fn record_limit_ignores_other_streams() {
        let mut emitter = CapturingEmitter::with_record_limit("public-COW", 0);
        let record = TapMessage::Record {
            stream: "public-CHICKEN".to_string(),
            record: Map::new(),
            version: 1,
            time_extracted: "2020-09-01T00:00:00.000000Z".to_string(),
        };
        assert!(emitter.emit(&record).is_ok());
    }
}
