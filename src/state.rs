//! Bookmark state
//!
//! Per-stream resume cursors, serialized to the downstream as STATE messages.
//! A bookmark is an open map; the engine uses the keys `version`, `xmin`,
//! `lsn`, `replication_key`, `replication_key_value` and
//! `last_replication_method`. A committed copy of the same shape is written
//! by the external supervisor after it has durably persisted records; the
//! LOG_BASED strategy reads that file to learn how far it may ask PostgreSQL
//! to discard WAL.

use crate::errors::TapResult;
use crate::messages::TapMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Records between interim STATE messages in bulk strategies
pub const UPDATE_BOOKMARK_PERIOD: usize = 10_000;

/// The whole bookmark map plus the stream currently being synced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub bookmarks: HashMap<String, Map<String, Value>>,
    #[serde(default)]
    pub currently_syncing: Option<String>,
}

impl State {
    /// Loads a state file; an absent path yields the empty state.
    pub fn from_file(path: &Path) -> TapResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let state: State = serde_json::from_str(&raw)?;
        Ok(state)
    }

    /// Best-effort read of the committed-state file. Returns None when the
    /// file is missing or does not parse; the caller keeps its previous view.
    pub fn read_committed(path: &Path) -> Option<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    debug!("Unable to parse committed state {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                debug!("Unable to open committed state {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Bookmark value for a stream, or None
    pub fn get(&self, tap_stream_id: &str, key: &str) -> Option<&Value> {
        self.bookmarks.get(tap_stream_id).and_then(|b| b.get(key))
    }

    /// Bookmark value as i64 (version, xmin, lsn)
    pub fn get_i64(&self, tap_stream_id: &str, key: &str) -> Option<i64> {
        self.get(tap_stream_id, key).and_then(|v| v.as_i64())
    }

    /// Bookmark value as a string
    pub fn get_str(&self, tap_stream_id: &str, key: &str) -> Option<&str> {
        self.get(tap_stream_id, key).and_then(|v| v.as_str())
    }

    /// Writes one bookmark key; other keys of the stream are untouched.
    pub fn set<V: Into<Value>>(&mut self, tap_stream_id: &str, key: &str, value: V) {
        self.bookmarks
            .entry(tap_stream_id.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Removes one bookmark key.
    pub fn clear_key(&mut self, tap_stream_id: &str, key: &str) {
        if let Some(bookmark) = self.bookmarks.get_mut(tap_stream_id) {
            bookmark.remove(key);
        }
    }

    /// Deletes every bookmark key for the stream.
    pub fn reset_stream(&mut self, tap_stream_id: &str) {
        self.bookmarks.insert(tap_stream_id.to_string(), Map::new());
    }

    /// Invalidates stale state before a run.
    ///
    /// A changed replication method nukes the stream's bookmark, as does a
    /// changed replication key under INCREMENTAL. The current method is
    /// always written back.
    pub fn reconcile(
        &mut self,
        tap_stream_id: &str,
        replication_method: &str,
        replication_key: Option<&str>,
    ) {
        let last_method = self
            .get_str(tap_stream_id, "last_replication_method")
            .map(|s| s.to_string());
        if let Some(last) = last_method {
            if last != replication_method {
                debug!(
                    "Replication method for {} changed from {} to {}, resetting state",
                    tap_stream_id, last, replication_method
                );
                self.reset_stream(tap_stream_id);
            }
        }

        if replication_method == "INCREMENTAL" {
            let bookmarked_key = self.get_str(tap_stream_id, "replication_key");
            if bookmarked_key != replication_key {
                debug!("Replication key for {} changed, resetting state", tap_stream_id);
                self.reset_stream(tap_stream_id);
            }
        }

        self.set(tap_stream_id, "last_replication_method", replication_method);
    }

    /// STATE wire message holding a deep copy of the bookmark map
    pub fn to_message(&self) -> TapResult<TapMessage> {
        Ok(TapMessage::State {
            value: serde_json::to_value(self)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_preserves_unrelated_keys() {
        let mut state = State::default();
        state.set("public-COW", "version", 1);
        state.set("public-COW", "xmin", 500);
        state.set("public-COW", "xmin", 600);
        assert_eq!(state.get_i64("public-COW", "version"), Some(1));
        assert_eq!(state.get_i64("public-COW", "xmin"), Some(600));

        state.clear_key("public-COW", "xmin");
        assert_eq!(state.get("public-COW", "xmin"), None);
        assert_eq!(state.get_i64("public-COW", "version"), Some(1));
    }

    #[test]
    fn reset_drops_all_keys() {
        let mut state = State::default();
        state.set("public-COW", "version", 1);
        state.set("public-COW", "lsn", 123);
        state.reset_stream("public-COW");
        assert_eq!(state.get("public-COW", "version"), None);
        assert_eq!(state.get("public-COW", "lsn"), None);
    }

    #[test]
    fn reconcile_resets_on_method_change() {
        let mut state = State::default();
        state.set("public-COW", "last_replication_method", "FULL_TABLE");
        state.set("public-COW", "xmin", 500);

        state.reconcile("public-COW", "LOG_BASED", None);
        assert_eq!(state.get("public-COW", "xmin"), None);
        assert_eq!(
            state.get_str("public-COW", "last_replication_method"),
            Some("LOG_BASED")
        );
    }

    #[test]
    fn reconcile_resets_on_incremental_key_change() {
        let mut state = State::default();
        state.set("public-COW", "last_replication_method", "INCREMENTAL");
        state.set("public-COW", "replication_key", "updated_at");
        state.set("public-COW", "replication_key_value", "2020-01-01");

        state.reconcile("public-COW", "INCREMENTAL", Some("id"));
        assert_eq!(state.get("public-COW", "replication_key_value"), None);
    }

    #[test]
    fn reconcile_keeps_matching_state() {
        let mut state = State::default();
        state.set("public-COW", "last_replication_method", "INCREMENTAL");
        state.set("public-COW", "replication_key", "id");
        state.set("public-COW", "replication_key_value", 42);

        state.reconcile("public-COW", "INCREMENTAL", Some("id"));
        assert_eq!(state.get_i64("public-COW", "replication_key_value"), Some(42));
    }

    #[test]
    fn state_message_shape() {
        let mut state = State::default();
        state.set("public-COW", "version", 1);
        state.currently_syncing = Some("public-COW".to_string());

        match state.to_message().unwrap() {
            TapMessage::State { value } => {
                assert_eq!(value["bookmarks"]["public-COW"]["version"], json!(1));
                assert_eq!(value["currently_syncing"], json!("public-COW"));
            }
            _ => panic!("expected STATE"),
        }
    }

    #[test]
    fn currently_syncing_serializes_as_null() {
        let state = State::default();
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("currently_syncing").unwrap().is_null());
    }
}
