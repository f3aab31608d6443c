//! Diagnostics and dead-letter sinks
//!
//! Both are string→JSON key-value namespaces written fire-and-forget: a
//! failed diagnostics write is logged and forgotten, never allowed to touch
//! the logging path. The dead-letter namespace uses the same trait but is a
//! distinct instance so quarantined batches cannot collide with snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::record::LogRecord;

/// TTL for instance-alive registrations. Outlives several default alarm
/// intervals so a live instance never flickers out of the active set.
pub const ACTIVE_TTL_SECONDS: u64 = 65;

pub const LAST_FIREHOSE_BATCH: &str = "last_firehose_batch";
pub const LAST_FIREHOSE_EVENT: &str = "last_firehose_event";
pub const LAST_FAILED_BATCH: &str = "last_failed_batch";
pub const PRUNING_SUMMARY: &str = "pruning_summary";

pub fn state_key(instance: &str) -> String {
    format!("state_{instance}")
}

pub fn active_key(instance: &str) -> String {
    format!("active_do_{instance}")
}

pub fn deadletter_key(table: &str, at: DateTime<Utc>) -> String {
    format!("deadletter_{table}_{}", crate::util::iso8601(at))
}

/// A string→JSON namespace with optional TTL-seconds on put.
pub trait KvNamespace: Send + Sync {
    /// Fire-and-forget write. Implementations log failures internally.
    fn put(&self, key: &str, value: serde_json::Value, ttl_seconds: Option<u64>);

    fn get(&self, key: &str) -> Option<serde_json::Value>;
}

/// In-memory namespace with TTL expiry. The default for embedders that have
/// no external KV service, and the double used throughout the tests.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (serde_json::Value, Option<Instant>)>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// All live keys, sorted. Test/introspection helper.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, (_, deadline))| deadline.map_or(true, |d| d > now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }
}

impl KvNamespace for MemoryKv {
    fn put(&self, key: &str, value: serde_json::Value, ttl_seconds: Option<u64>) {
        let deadline = ttl_seconds.map(|s| Instant::now() + Duration::from_secs(s));
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, deadline));
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entries = self.entries.lock().unwrap();
        let (value, deadline) = entries.get(key)?;
        if deadline.is_some_and(|d| d <= Instant::now()) {
            return None;
        }
        Some(value.clone())
    }
}

/// Point-in-time view of one batcher instance, written on every alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub colo: Option<String>,
    /// Buffered record count per table.
    pub batches: BTreeMap<String, usize>,
    pub failure_counts: BTreeMap<String, u32>,
    pub has_plan: bool,
    /// Next alarm deadline, epoch milliseconds.
    pub alarm_time: Option<i64>,
}

/// Instance-alive registration, written with [`ACTIVE_TTL_SECONDS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveInstance {
    pub colo: Option<String>,
    pub last_seen: String,
}

/// Payload pushed when a batch write fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedBatch {
    pub timestamp: String,
    pub table_name: String,
    pub error: String,
    pub batch: Vec<LogRecord>,
}

/// One table's entry in the pruning summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneSummaryEntry {
    pub last_pruned_timestamp: String,
    pub last_rows_deleted: u64,
    pub last_prune_duration_ms: u64,
}

/// Merge one table's entry into the shared pruning summary document.
pub fn record_prune_summary(kv: &dyn KvNamespace, table: &str, entry: PruneSummaryEntry) {
    let mut summary: BTreeMap<String, PruneSummaryEntry> = kv
        .get(PRUNING_SUMMARY)
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    summary.insert(table.to_string(), entry);
    match serde_json::to_value(&summary) {
        Ok(value) => kv.put(PRUNING_SUMMARY, value, None),
        Err(e) => tracing::warn!(error = %e, "pruning summary did not serialize"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_memory_kv_put_get() {
        let kv = MemoryKv::new();
        kv.put("k", serde_json::json!({"a": 1}), None);
        assert_eq!(kv.get("k").unwrap()["a"], 1);
        assert!(kv.get("missing").is_none());
    }

    #[test]
    fn test_memory_kv_ttl_expiry() {
        let kv = MemoryKv::new();
        kv.put("ephemeral", serde_json::json!(true), Some(0));
        // Zero TTL is already past its deadline
        assert!(kv.get("ephemeral").is_none());
        assert!(kv.keys().is_empty());

        kv.put("live", serde_json::json!(true), Some(3600));
        assert!(kv.get("live").is_some());
    }

    #[test]
    fn test_key_shapes() {
        assert_eq!(state_key("batcher-1"), "state_batcher-1");
        assert_eq!(active_key("batcher-1"), "active_do_batcher-1");
        let at = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(
            deadletter_key("log_api", at),
            "deadletter_log_api_2024-03-01T12:00:00.000Z"
        );
    }

    #[test]
    fn test_prune_summary_merges_tables() {
        let kv = MemoryKv::new();
        record_prune_summary(
            &kv,
            "log_a",
            PruneSummaryEntry {
                last_rows_deleted: 5,
                ..Default::default()
            },
        );
        record_prune_summary(
            &kv,
            "log_b",
            PruneSummaryEntry {
                last_rows_deleted: 9,
                ..Default::default()
            },
        );

        let summary = kv.get(PRUNING_SUMMARY).unwrap();
        assert_eq!(summary["log_a"]["last_rows_deleted"], 5);
        assert_eq!(summary["log_b"]["last_rows_deleted"], 9);
    }
}
