//! Log records - the flat field map that flows through the pipeline
//!
//! A record is assembled once per request, cloned by value into each matched
//! table's buffer, and freed after a successful flush (or once written to
//! the dead-letter store). Structured fields (headers, caller data, the
//! environment snapshot) are stored pre-serialized as JSON strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single field value. Field names come from the master schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Null,
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => FieldValue::Null,
        }
    }
}

/// Flat field-name → value mapping for one logged request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(flatten)]
    fields: HashMap<String, FieldValue>,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        self.fields.insert(name.to_string(), value.into());
    }

    /// Returns the stored value; absent fields read as null.
    pub fn get(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&FieldValue::Null)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Primary key; empty string only for records that skipped assembly.
    pub fn log_id(&self) -> &str {
        self.get_str("logId").unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Generate a time-sortable unique log id from the worker start time.
///
/// Layout: zero-padded epoch milliseconds, a per-process random tag, and a
/// wrapping sequence counter. The millisecond prefix keeps ids sortable by
/// arrival time; the tag and counter keep them unique across concurrent
/// workers logging in the same millisecond.
pub fn generate_log_id(at: DateTime<Utc>) -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
    // Use RandomState to get a random value without adding a dependency
    let random = RandomState::new().build_hasher().finish();
    format!(
        "{:013}-{:04x}{:04x}",
        at.timestamp_millis(),
        random & 0xFFFF,
        seq & 0xFFFF
    )
}
