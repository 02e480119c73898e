// log-enricher - model.rs
//
// Core data model shared by every component: the unit flowing through the
// pipeline (`LogEntry`), the dynamically-typed field value it carries, and
// the durable per-file state record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A dynamically-typed field value: string, number, boolean, or nested
/// mapping. Kept as a local enum rather than a bare `serde_json::Value`
/// re-export so pool reuse and entry-clearing semantics stay explicit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    String(String),
    Number(f64),
    Bool(bool),
    Map(HashMap<String, FieldValue>),
}

impl From<JsonValue> for FieldValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::String(s) => FieldValue::String(s),
            JsonValue::Number(n) => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::Bool(b) => FieldValue::Bool(b),
            JsonValue::Object(map) => {
                FieldValue::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            // Arrays and null have no direct representation in the field
            // model; stringify so information is not silently dropped.
            other => FieldValue::String(other.to_string()),
        }
    }
}

impl From<FieldValue> for JsonValue {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::String(s) => JsonValue::String(s),
            FieldValue::Number(n) => serde_json::Number::from_f64(n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Bool(b) => JsonValue::Bool(b),
            FieldValue::Map(map) => {
                JsonValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl FieldValue {
    /// Best-effort string view, used by extractors that read a field as a
    /// candidate string value (e.g. client-IP, timestamp extraction).
    pub fn as_str_lossy(&self) -> Option<String> {
        match self {
            FieldValue::String(s) => Some(s.clone()),
            FieldValue::Number(n) => Some(n.to_string()),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Map(_) => None,
        }
    }
}

/// The unit flowing through the pipeline.
///
/// Ownership: exclusively owned by the processing task from the moment the
/// line is read until the sink's send returns; then the entry (including
/// its `fields` map) is returned to the entry pool.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Canonical absolute path identifying the originating log file, or the
    /// receiver-assigned synthetic path for pushed entries.
    pub source_path: String,

    /// Short label identifying the producing application.
    pub app: String,

    /// The raw bytes of the log line, newline trimmed.
    pub line: String,

    /// Case-preserving, unique keys populated by parsers and enrichers.
    pub fields: HashMap<String, FieldValue>,

    /// UTC instant; zero until a timestamp-extraction stage or the
    /// processor's "now" fallback sets it.
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// The sentinel timestamp an entry carries until something sets it.
    pub fn zero_timestamp() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(0, 0).expect("epoch zero is always representable")
    }

    /// A freshly allocated, empty entry — used by the entry pool when no
    /// reusable entry is available.
    pub fn new_empty() -> Self {
        LogEntry {
            source_path: String::new(),
            app: String::new(),
            line: String::new(),
            fields: HashMap::new(),
            timestamp: Self::zero_timestamp(),
        }
    }

    /// Clear mutable content while reusing the `fields` map's allocation,
    /// per the entry pool's release contract.
    pub fn reset_for_reuse(&mut self) {
        self.source_path.clear();
        self.app.clear();
        self.line.clear();
        self.fields.clear();
        self.timestamp = Self::zero_timestamp();
    }

    pub fn is_timestamp_zero(&self) -> bool {
        self.timestamp == Self::zero_timestamp()
    }
}

/// Per-tailed-file durable record.
///
/// Invariant: `line_number` equals the number of lines the tailer has
/// emitted to the pipeline from this file since its current identity
/// began. `inode`, `file_size`, `last_modified` are refreshed only at
/// shutdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub path: String,
    pub line_number: i64,
    /// Opaque 64-bit file identity; 0 if the platform doesn't provide one.
    #[serde(default)]
    pub inode: u64,
    #[serde(default)]
    pub file_size: u64,
    /// Seconds since epoch.
    #[serde(default)]
    pub last_modified: i64,
}

impl FileState {
    pub fn new(path: impl Into<String>) -> Self {
        FileState {
            path: path.into(),
            line_number: 0,
            inode: 0,
            file_size: 0,
            last_modified: 0,
        }
    }
}

/// The on-disk state root.
///
/// `cache` is a legacy key retained for forward on-disk compatibility: it
/// is read and round-tripped but never written to by this implementation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default)]
    pub files: HashMap<String, FileState>,

    #[serde(default)]
    pub caches: HashMap<String, HashMap<String, JsonValue>>,

    #[serde(default)]
    pub cache: HashMap<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_value_json_round_trip_preserves_shape() {
        let json = serde_json::json!({"a": "x", "b": 1.5, "c": true, "d": {"e": "f"}});
        let fv: FieldValue = json.clone().into();
        let back: JsonValue = fv.into();
        assert_eq!(json, back);
    }

    #[test]
    fn reset_for_reuse_clears_but_keeps_allocation() {
        let mut entry = LogEntry::new_empty();
        entry.fields.insert("k".to_string(), FieldValue::String("v".to_string()));
        entry.line = "hello".to_string();
        entry.timestamp = Utc::now();
        let cap_before = entry.fields.capacity();

        entry.reset_for_reuse();

        assert!(entry.fields.is_empty());
        assert!(entry.line.is_empty());
        assert!(entry.is_timestamp_zero());
        assert_eq!(entry.fields.capacity(), cap_before);
    }
}
