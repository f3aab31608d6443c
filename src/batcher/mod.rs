//! Shard dispatcher and batcher registry
//!
//! Records are dispatched to a small set of long-lived batcher instances.
//! The shard key is the edge ray id when present (so a retried request
//! lands on the same instance) and the log id otherwise; the key hashes to
//! a stable instance name. Instances are spawned on first contact and
//! receive the compiled plan before anything else, so alarm-driven flushes
//! can always resolve their routes.

pub mod instance;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::diagnostics::KvNamespace;
use crate::metrics::MetricsSink;
use crate::plan::LogPlan;
use crate::record::LogRecord;
use crate::store::LogStore;
use instance::Command;

/// Batcher tuning. Values come from the configuration surface and are
/// already defensively parsed by the time they land here.
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_interval: Duration,
    pub max_batch_size: usize,
    pub max_retries: u32,
    pub channel_capacity: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(10_000),
            max_batch_size: 200,
            max_retries: 3,
            channel_capacity: 1024,
        }
    }
}

/// Shared collaborators handed to every instance.
pub struct BatcherDeps {
    pub store: Arc<dyn LogStore>,
    pub diagnostics: Arc<dyn KvNamespace>,
    pub dead_letter: Arc<dyn KvNamespace>,
    pub metrics: Arc<dyn MetricsSink>,
    pub config: BatcherConfig,
}

/// Cheap handle to one batcher instance. Every operation is a message to
/// the instance's single-consumer task; none of them can fail the caller.
#[derive(Clone)]
pub struct BatcherHandle {
    name: String,
    tx: mpsc::Sender<Command>,
}

impl BatcherHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget enqueue of a record for its matched tables.
    pub async fn add_log(&self, record: LogRecord, tables: Vec<String>) {
        if self.tx.send(Command::AddLog { record, tables }).await.is_err() {
            tracing::warn!(instance = %self.name, "batcher instance is gone; record dropped");
        }
    }

    /// Install the compiled plan, awaiting the instance's acknowledgement.
    pub async fn set_log_plan(&self, plan: Arc<LogPlan>) {
        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(Command::SetLogPlan { plan, ack: Some(ack) })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Run the retention check for one table, awaiting completion. Failures
    /// are recorded by the instance, not returned.
    pub async fn run_retention_check(&self, table: impl Into<String>) {
        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(Command::RunRetentionCheck {
                table: table.into(),
                ack,
            })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    /// Best-effort drain and stop.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown { ack }).await.is_ok() {
            let _ = done.await;
        }
    }
}

/// Owns the instance map and the deterministic name-to-instance mapping.
pub struct BatcherRegistry {
    shard_count: u32,
    deps: Arc<BatcherDeps>,
    instances: Mutex<HashMap<String, BatcherHandle>>,
}

impl BatcherRegistry {
    pub fn new(shard_count: u32, deps: BatcherDeps) -> Self {
        Self {
            shard_count: shard_count.max(1),
            deps: Arc::new(deps),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Deterministic shard instance name for a shard key: same request,
    /// same batcher.
    pub fn shard_name(&self, shard_key: &str) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(shard_key.as_bytes());
        format!("batcher-{}", hasher.finalize() % self.shard_count)
    }

    /// Get or spawn the named instance. A freshly spawned instance receives
    /// the plan before the handle is released, so no command can reach it
    /// plan-less.
    pub async fn instance(&self, name: &str, plan: &Arc<LogPlan>) -> BatcherHandle {
        let mut instances = self.instances.lock().await;
        if let Some(handle) = instances.get(name) {
            return handle.clone();
        }
        let handle = instance::spawn(name.to_string(), self.deps.clone());
        handle.set_log_plan(plan.clone()).await;
        instances.insert(name.to_string(), handle.clone());
        handle
    }

    /// Route one record to its shard.
    pub async fn dispatch(
        &self,
        plan: &Arc<LogPlan>,
        shard_key: &str,
        record: LogRecord,
        tables: Vec<String>,
    ) {
        let handle = self.instance(&self.shard_name(shard_key), plan).await;
        handle.add_log(record, tables).await;
    }

    /// Dedicated instance for cron pruning of one table, kept apart from
    /// the ingest shards so prune latency never stalls them.
    pub async fn pruner_instance(&self, table: &str, plan: &Arc<LogPlan>) -> BatcherHandle {
        self.instance(&format!("pruner_{table}"), plan).await
    }

    /// Drain and stop every instance.
    pub async fn shutdown_all(&self) {
        let handles: Vec<BatcherHandle> = {
            let mut instances = self.instances.lock().await;
            instances.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
