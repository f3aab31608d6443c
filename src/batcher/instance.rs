//! A single batcher instance - the durable accumulator behind one shard
//!
//! Each instance is a tokio task owning its buffers outright: commands
//! arrive over a channel and at most one handler runs at a time, so the
//! flush protocol's claim step is a plain synchronous `mem::take` with no
//! lock. The only shared state (schema fingerprints, last-pruned marks)
//! lives in the store's meta table.
//!
//! ```text
//! addLog ──► buffer per table ──► size trigger ──┐
//!                 ▲                              ├──► claim ► init ► INSERT batch
//! alarm  ────────(rearmed on every add)──────────┘        │
//!                                                         ├─ ok: reset failures, diagnostics
//!                                                         └─ err: re-prepend, retry, dead-letter
//! ```

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

use super::{BatcherDeps, BatcherHandle};
use crate::diagnostics::{
    self, record_prune_summary, ActiveInstance, FailedBatch, InstanceSnapshot, PruneSummaryEntry,
};
use crate::metrics::WriteOutcome;
use crate::plan::{CompiledLogRoute, LogPlan};
use crate::prune::{prune_table, MS_PER_DAY};
use crate::record::LogRecord;
use crate::schema_mgr;
use crate::store::{SqlValue, Statement};
use crate::util::iso8601;

pub(crate) enum Command {
    AddLog {
        record: LogRecord,
        tables: Vec<String>,
    },
    SetLogPlan {
        plan: Arc<LogPlan>,
        ack: Option<oneshot::Sender<()>>,
    },
    RunRetentionCheck {
        table: String,
        ack: oneshot::Sender<()>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Spawn an instance task and return its handle.
pub(crate) fn spawn(name: String, deps: Arc<BatcherDeps>) -> BatcherHandle {
    let (tx, rx) = mpsc::channel(deps.config.channel_capacity);
    let instance = BatcherInstance {
        name: name.clone(),
        deps,
        rx,
        batches: HashMap::new(),
        failure_counts: HashMap::new(),
        initialized: HashSet::new(),
        plan: None,
        colo: None,
        alarm: None,
        alarm_epoch_ms: None,
    };
    tokio::spawn(instance.run());
    BatcherHandle { name, tx }
}

struct BatcherInstance {
    name: String,
    deps: Arc<BatcherDeps>,
    rx: mpsc::Receiver<Command>,
    /// Per-table in-memory buffers, in arrival order.
    batches: HashMap<String, Vec<LogRecord>>,
    /// Consecutive flush failures per table. Process-local on purpose: a
    /// restart restarts the retry ladder instead of inheriting it.
    failure_counts: HashMap<String, u32>,
    /// Tables whose schema init already ran this instance lifetime.
    initialized: HashSet<String>,
    plan: Option<Arc<LogPlan>>,
    colo: Option<String>,
    alarm: Option<tokio::time::Instant>,
    alarm_epoch_ms: Option<i64>,
}

impl BatcherInstance {
    async fn run(mut self) {
        tracing::debug!(instance = %self.name, "batcher instance started");
        loop {
            let deadline = self.alarm.unwrap_or_else(tokio::time::Instant::now);
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Command::AddLog { record, tables }) => {
                        self.handle_add_log(record, tables).await;
                    }
                    Some(Command::SetLogPlan { plan, ack }) => {
                        self.plan = Some(plan);
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                    }
                    Some(Command::RunRetentionCheck { table, ack }) => {
                        self.handle_retention_check(&table).await;
                        let _ = ack.send(());
                    }
                    Some(Command::Shutdown { ack }) => {
                        self.drain().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        // All handles dropped: best-effort drain, then stop
                        self.drain().await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if self.alarm.is_some() => {
                    self.alarm = None;
                    self.alarm_epoch_ms = None;
                    self.handle_alarm().await;
                }
            }
        }
        tracing::debug!(instance = %self.name, "batcher instance stopped");
    }

    async fn handle_add_log(&mut self, record: LogRecord, tables: Vec<String>) {
        if self.colo.is_none() {
            self.colo = record.get_str("colo").map(str::to_string);
        }

        let mut full = Vec::new();
        for table in tables {
            let buffer = self.batches.entry(table.clone()).or_default();
            buffer.push(record.clone());
            if buffer.len() >= self.deps.config.max_batch_size {
                full.push(table);
            }
        }
        if !full.is_empty() {
            // Size-triggered flush. Guarded: the flush protocol records its
            // own failures and none of them reach the add.
            self.flush_tables(full).await;
        }

        self.arm_alarm();
    }

    /// Arm (or re-time) the alarm to now + interval. Runs on every add.
    fn arm_alarm(&mut self) {
        let interval = self.deps.config.batch_interval;
        self.alarm = Some(tokio::time::Instant::now() + interval);
        self.alarm_epoch_ms = Some(Utc::now().timestamp_millis() + interval.as_millis() as i64);
    }

    async fn handle_alarm(&mut self) {
        self.publish_snapshot();

        if self.plan.is_none() {
            tracing::error!(
                instance = %self.name,
                buffered_tables = self.batches.values().filter(|b| !b.is_empty()).count(),
                "alarm fired with no log plan; keeping buffers"
            );
            return;
        }

        let tables: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(table, _)| table.clone())
            .collect();
        if !tables.is_empty() {
            self.flush_tables(tables).await;
        }
    }

    /// Fire-and-forget state snapshot and alive registration.
    fn publish_snapshot(&self) {
        let snapshot = InstanceSnapshot {
            id: self.name.clone(),
            colo: self.colo.clone(),
            batches: self
                .batches
                .iter()
                .map(|(t, b)| (t.clone(), b.len()))
                .collect::<BTreeMap<_, _>>(),
            failure_counts: self
                .failure_counts
                .iter()
                .map(|(t, c)| (t.clone(), *c))
                .collect(),
            has_plan: self.plan.is_some(),
            alarm_time: self.alarm_epoch_ms,
        };
        if let Ok(value) = serde_json::to_value(&snapshot) {
            self.deps
                .diagnostics
                .put(&diagnostics::state_key(&self.name), value, None);
        }
        if let Ok(value) = serde_json::to_value(&ActiveInstance {
            colo: self.colo.clone(),
            last_seen: iso8601(Utc::now()),
        }) {
            self.deps.diagnostics.put(
                &diagnostics::active_key(&self.name),
                value,
                Some(diagnostics::ACTIVE_TTL_SECONDS),
            );
        }
    }

    /// Flush the named tables concurrently. Claiming happens synchronously
    /// up front, before the first await, so an interleaved add can only
    /// ever see an empty, fresh buffer.
    async fn flush_tables(&mut self, tables: Vec<String>) {
        let Some(plan) = self.plan.clone() else {
            tracing::error!(instance = %self.name, "flush requested with no log plan");
            return;
        };

        let mut jobs = Vec::new();
        for table in tables {
            let Some(route) = plan.route(&table) else {
                tracing::warn!(
                    instance = %self.name,
                    table = %table,
                    "no route for buffered table; keeping buffer for retry"
                );
                continue;
            };
            let batch = match self.batches.get_mut(&table) {
                Some(buffer) if !buffer.is_empty() => std::mem::take(buffer),
                _ => continue,
            };
            jobs.push(FlushJob {
                route: route.clone(),
                batch,
                needs_init: !self.initialized.contains(&table),
            });
        }
        if jobs.is_empty() {
            return;
        }

        let workers = jobs.into_iter().map(|job| {
            let deps = self.deps.clone();
            let colo = self.colo.clone();
            tokio::task::spawn_blocking(move || flush_table(&deps, job, colo.as_deref()))
        });
        for result in futures::future::join_all(workers).await {
            match result {
                Ok(outcome) => self.apply_flush_outcome(outcome),
                Err(e) => {
                    tracing::error!(instance = %self.name, error = %e, "flush worker died")
                }
            }
        }
    }

    fn apply_flush_outcome(&mut self, outcome: FlushOutcome) {
        let FlushOutcome {
            table,
            batch,
            duration_ms,
            result,
        } = outcome;
        let size = batch.len();
        let is_firehose = self
            .plan
            .as_ref()
            .is_some_and(|plan| plan.is_firehose(&table));

        match result {
            Ok(()) => {
                self.failure_counts.insert(table.clone(), 0);
                self.initialized.insert(table.clone());
                if is_firehose {
                    if let Ok(value) = serde_json::to_value(&batch) {
                        self.deps
                            .diagnostics
                            .put(diagnostics::LAST_FIREHOSE_BATCH, value, None);
                    }
                    if let Some(last) = batch.last() {
                        if let Ok(value) = serde_json::to_value(last) {
                            self.deps
                                .diagnostics
                                .put(diagnostics::LAST_FIREHOSE_EVENT, value, None);
                        }
                    }
                }
                self.deps.metrics.batch_write(
                    &table,
                    WriteOutcome::Success,
                    self.colo.as_deref(),
                    size,
                    duration_ms,
                );
                tracing::debug!(instance = %self.name, table = %table, size, duration_ms, "batch written");
            }
            Err(error) => {
                tracing::warn!(
                    instance = %self.name,
                    table = %table,
                    size,
                    error = %error,
                    "batch write failed"
                );
                let failed = FailedBatch {
                    timestamp: iso8601(Utc::now()),
                    table_name: table.clone(),
                    error: error.clone(),
                    batch: batch.clone(),
                };
                if let Ok(value) = serde_json::to_value(&failed) {
                    self.deps
                        .diagnostics
                        .put(diagnostics::LAST_FAILED_BATCH, value, None);
                }

                let count = self.failure_counts.entry(table.clone()).or_insert(0);
                *count += 1;
                if *count >= self.deps.config.max_retries {
                    *count = 0;
                    let key = diagnostics::deadletter_key(&table, Utc::now());
                    tracing::error!(
                        instance = %self.name,
                        table = %table,
                        size,
                        key = %key,
                        "retry budget exhausted; batch quarantined to dead-letter"
                    );
                    if let Ok(value) = serde_json::to_value(&batch) {
                        self.deps.dead_letter.put(&key, value, None);
                    }
                } else {
                    // Re-prepend the failed batch so records flush in their
                    // original order on the next attempt
                    let buffer = self.batches.entry(table.clone()).or_default();
                    let mut merged = batch;
                    merged.append(buffer);
                    *buffer = merged;
                }
                self.deps.metrics.batch_write(
                    &table,
                    WriteOutcome::Failure,
                    self.colo.as_deref(),
                    size,
                    duration_ms,
                );
            }
        }
    }

    /// Best-effort shutdown drain. Nothing escapes this hook.
    async fn drain(&mut self) {
        let tables: Vec<String> = self
            .batches
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(table, _)| table.clone())
            .collect();
        if tables.is_empty() {
            return;
        }
        if self.plan.is_none() {
            tracing::warn!(
                instance = %self.name,
                buffered_tables = tables.len(),
                "shutdown with no plan; buffered records lost"
            );
            return;
        }
        tracing::info!(instance = %self.name, tables = tables.len(), "draining before shutdown");
        self.flush_tables(tables).await;
    }

    async fn handle_retention_check(&mut self, table: &str) {
        let Some(plan) = self.plan.clone() else {
            tracing::error!(instance = %self.name, table, "retention check with no log plan");
            return;
        };
        let Some(route) = plan.route(table) else {
            tracing::warn!(instance = %self.name, table, "retention check for unknown route");
            return;
        };
        let (Some(retention_days), Some(interval_days)) =
            (route.retention_days, route.pruning_interval_days)
        else {
            tracing::debug!(instance = %self.name, table, "route has no retention policy");
            return;
        };

        let deps = self.deps.clone();
        let route = route.clone();
        let colo = self.colo.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            run_retention(&deps, &route, retention_days, interval_days, colo.as_deref())
        })
        .await;

        match outcome {
            Ok(RetentionOutcome::Skipped) => {
                tracing::debug!(instance = %self.name, table, "retention interval not elapsed");
            }
            Ok(RetentionOutcome::Pruned {
                rows_deleted,
                duration_ms,
            }) => {
                self.deps.metrics.data_pruning(
                    table,
                    WriteOutcome::Success,
                    self.colo.as_deref(),
                    rows_deleted,
                    duration_ms,
                );
                record_prune_summary(
                    self.deps.diagnostics.as_ref(),
                    table,
                    PruneSummaryEntry {
                        last_pruned_timestamp: iso8601(Utc::now()),
                        last_rows_deleted: rows_deleted,
                        last_prune_duration_ms: duration_ms,
                    },
                );
                tracing::info!(instance = %self.name, table, rows_deleted, "retention prune done");
            }
            Ok(RetentionOutcome::Failed { error, duration_ms }) => {
                tracing::error!(instance = %self.name, table, error = %error, "retention prune failed");
                self.deps.metrics.data_pruning(
                    table,
                    WriteOutcome::Failure,
                    self.colo.as_deref(),
                    0,
                    duration_ms,
                );
            }
            Err(e) => {
                tracing::error!(instance = %self.name, table, error = %e, "retention worker died");
            }
        }
    }
}

struct FlushJob {
    route: CompiledLogRoute,
    batch: Vec<LogRecord>,
    needs_init: bool,
}

struct FlushOutcome {
    table: String,
    batch: Vec<LogRecord>,
    duration_ms: u64,
    /// Error rendered to a string so the outcome can cross the blocking
    /// worker boundary and land in diagnostics as-is.
    result: Result<(), String>,
}

/// Synchronous flush body, run on a blocking worker: schema init when
/// needed, then the whole batch as one transactional store call.
fn flush_table(deps: &BatcherDeps, job: FlushJob, colo: Option<&str>) -> FlushOutcome {
    let start = Instant::now();
    let table = job.route.table_name.clone();
    let result = write_batch(deps, &job.route, &job.batch, job.needs_init, colo);
    FlushOutcome {
        table,
        batch: job.batch,
        duration_ms: start.elapsed().as_millis() as u64,
        result: result.map_err(|e| format!("{e:#}")),
    }
}

fn write_batch(
    deps: &BatcherDeps,
    route: &CompiledLogRoute,
    batch: &[LogRecord],
    needs_init: bool,
    colo: Option<&str>,
) -> anyhow::Result<()> {
    if needs_init {
        schema_mgr::initialize(deps.store.as_ref(), route, deps.metrics.as_ref(), colo)?;
    }

    let columns: Vec<String> = route
        .schema
        .iter()
        .map(|col| format!("\"{}\"", col.name))
        .collect();
    let placeholders: Vec<String> = (1..=route.schema.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO \"{}\" ({}) VALUES ({})",
        route.table_name,
        columns.join(", "),
        placeholders.join(", ")
    );

    let statements: Vec<Statement> = batch
        .iter()
        .map(|record| Statement {
            sql: sql.clone(),
            params: route
                .schema
                .iter()
                .map(|col| SqlValue::from(record.get(col.name)))
                .collect(),
        })
        .collect();

    deps.store.batch(&statements)?;
    Ok(())
}

enum RetentionOutcome {
    Skipped,
    Pruned { rows_deleted: u64, duration_ms: u64 },
    Failed { error: String, duration_ms: u64 },
}

/// Synchronous retention body. The last-pruned mark only advances after a
/// successful prune, so a failed tick retries on the next cron run.
fn run_retention(
    deps: &BatcherDeps,
    route: &CompiledLogRoute,
    retention_days: u32,
    interval_days: u32,
    colo: Option<&str>,
) -> RetentionOutcome {
    let store = deps.store.as_ref();
    let now_ms = Utc::now().timestamp_millis();
    let start = Instant::now();

    let result = (|| -> anyhow::Result<Option<u64>> {
        schema_mgr::ensure_meta_table(store)?;
        let key = schema_mgr::last_pruned_key(&route.table_name);
        let last_pruned: i64 = schema_mgr::meta_get(store, &key)?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if now_ms - last_pruned <= interval_days as i64 * MS_PER_DAY {
            return Ok(None);
        }

        schema_mgr::initialize(store, route, deps.metrics.as_ref(), colo)?;
        let rows_deleted = prune_table(store, &route.table_name, retention_days)?;
        schema_mgr::meta_put(store, &key, &now_ms.to_string())?;
        Ok(Some(rows_deleted))
    })();

    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(None) => RetentionOutcome::Skipped,
        Ok(Some(rows_deleted)) => RetentionOutcome::Pruned {
            rows_deleted,
            duration_ms,
        },
        Err(e) => RetentionOutcome::Failed {
            error: format!("{e:#}"),
            duration_ms,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{BatcherConfig, BatcherRegistry};
    use crate::config::Config;
    use crate::diagnostics::{KvNamespace, MemoryKv};
    use crate::metrics::{MemoryMetrics, RecordedPoint};
    use crate::plan::{compile_plan, LogRouteConfig};
    use crate::store::{LogStore, Row, SqliteStore, StoreError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Store double that fails the first `failures` batch submissions.
    struct FlakyStore {
        inner: SqliteStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: SqliteStore::in_memory().unwrap(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    impl LogStore for FlakyStore {
        fn batch(&self, statements: &[Statement]) -> Result<(), StoreError> {
            // DDL batches (ALTERs) pass through; only row inserts flake
            let is_insert = statements.iter().any(|s| s.sql.starts_with("INSERT INTO"));
            if is_insert
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StoreError::Sql(rusqlite::Error::InvalidQuery));
            }
            self.inner.batch(statements)
        }

        fn exec(&self, sql: &str) -> Result<(), StoreError> {
            self.inner.exec(sql)
        }

        fn execute(&self, statement: &Statement) -> Result<usize, StoreError> {
            self.inner.execute(statement)
        }

        fn first(&self, statement: &Statement) -> Result<Option<Row>, StoreError> {
            self.inner.first(statement)
        }

        fn all(&self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
            self.inner.all(statement)
        }
    }

    struct Harness {
        registry: BatcherRegistry,
        plan: Arc<LogPlan>,
        store: Arc<dyn LogStore>,
        diagnostics: Arc<MemoryKv>,
        dead_letter: Arc<MemoryKv>,
        metrics: Arc<MemoryMetrics>,
    }

    fn harness(store: Arc<dyn LogStore>, config: BatcherConfig) -> Harness {
        let diagnostics = Arc::new(MemoryKv::new());
        let dead_letter = Arc::new(MemoryKv::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let plan_config = Config {
            firehose_table: "log_firehose".to_string(),
            ..Default::default()
        };
        let plan = Arc::new(compile_plan(&plan_config).unwrap());
        let registry = BatcherRegistry::new(
            2,
            BatcherDeps {
                store: store.clone(),
                diagnostics: diagnostics.clone(),
                dead_letter: dead_letter.clone(),
                metrics: metrics.clone(),
                config,
            },
        );
        Harness {
            registry,
            plan,
            store,
            diagnostics,
            dead_letter,
            metrics,
        }
    }

    fn record(n: u32) -> LogRecord {
        let mut record = LogRecord::new();
        record.set("logId", format!("{n:013}-test"));
        record.set("receivedAt", iso8601(Utc::now()));
        record.set("method", "GET");
        record
    }

    fn firehose_ids(store: &dyn LogStore) -> Vec<String> {
        store
            .all(&Statement::new(
                "SELECT \"logId\" FROM \"log_firehose\" ORDER BY rowid",
            ))
            .unwrap()
            .iter()
            .filter_map(|r| r.text("logId").map(str::to_string))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_size_triggered_flush() {
        let h = harness(
            Arc::new(SqliteStore::in_memory().unwrap()),
            BatcherConfig {
                max_batch_size: 3,
                batch_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        let handle = h.registry.instance("batcher-0", &h.plan).await;
        for n in 0..3 {
            handle.add_log(record(n), vec!["log_firehose".to_string()]).await;
        }
        // Shutdown acks only after in-flight work, so this is a barrier;
        // the flush itself was size-triggered long before the alarm.
        handle.shutdown().await;

        assert_eq!(firehose_ids(h.store.as_ref()).len(), 3);
        assert_eq!(h.metrics.writes_success.load(Ordering::Relaxed), 1);
        match &h.metrics.points()[..] {
            [RecordedPoint::SchemaMigration { .. }, RecordedPoint::BatchWrite { batch_size, .. }] => {
                assert_eq!(*batch_size, 3);
            }
            other => panic!("unexpected metric points: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_alarm_flush_and_snapshot() {
        let h = harness(
            Arc::new(SqliteStore::in_memory().unwrap()),
            BatcherConfig {
                max_batch_size: 200,
                batch_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let handle = h.registry.instance("batcher-0", &h.plan).await;
        handle.add_log(record(1), vec!["log_firehose".to_string()]).await;
        handle.add_log(record(2), vec!["log_firehose".to_string()]).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(firehose_ids(h.store.as_ref()).len(), 2);

        // Alarm published the state snapshot and the alive registration
        let snapshot = h.diagnostics.get("state_batcher-0").expect("snapshot");
        assert_eq!(snapshot["id"], "batcher-0");
        assert!(h.diagnostics.get("active_do_batcher-0").is_some());

        // Successful firehose flush pushed last batch and last event
        let last_batch = h.diagnostics.get(diagnostics::LAST_FIREHOSE_BATCH).unwrap();
        assert_eq!(last_batch.as_array().unwrap().len(), 2);
        assert!(h.diagnostics.get(diagnostics::LAST_FIREHOSE_EVENT).is_some());

        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fifo_order_across_retry() {
        // First insert batch fails once, then everything succeeds
        let h = harness(
            Arc::new(FlakyStore::new(1)),
            BatcherConfig {
                max_batch_size: 2,
                batch_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        let handle = h.registry.instance("batcher-0", &h.plan).await;
        for n in 0..6 {
            handle.add_log(record(n), vec!["log_firehose".to_string()]).await;
        }
        handle.shutdown().await;

        let ids = firehose_ids(h.store.as_ref());
        let expected: Vec<String> = (0..6).map(|n| format!("{n:013}-test")).collect();
        assert_eq!(ids, expected, "insertion order must survive the retry");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retry_exhaustion_goes_to_dead_letter() {
        let h = harness(
            Arc::new(FlakyStore::new(3)),
            BatcherConfig {
                max_batch_size: 1,
                batch_interval: Duration::from_secs(3600),
                max_retries: 3,
                ..Default::default()
            },
        );

        let handle = h.registry.instance("batcher-0", &h.plan).await;
        // Three size-triggered attempts, three failures, third quarantines
        for n in 0..3 {
            handle.add_log(record(n), vec!["log_firehose".to_string()]).await;
        }
        // Fourth add starts fresh and succeeds
        handle.add_log(record(3), vec!["log_firehose".to_string()]).await;
        handle.shutdown().await;

        let dead_keys = h.dead_letter.keys();
        assert_eq!(dead_keys.len(), 1, "exactly one dead-letter write");
        assert!(dead_keys[0].starts_with("deadletter_log_firehose_"));
        let quarantined = h.dead_letter.get(&dead_keys[0]).unwrap();
        assert_eq!(quarantined.as_array().unwrap().len(), 3);

        // Only the post-quarantine record reached the table
        assert_eq!(firehose_ids(h.store.as_ref()), vec!["0000000000003-test"]);
        assert_eq!(h.metrics.writes_failure.load(Ordering::Relaxed), 3);

        // Failure diagnostics were pushed along the way
        let failed = h.diagnostics.get(diagnostics::LAST_FAILED_BATCH).unwrap();
        assert_eq!(failed["table_name"], "log_firehose");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_alarm_without_plan_keeps_buffers() {
        let deps = Arc::new(BatcherDeps {
            store: Arc::new(SqliteStore::in_memory().unwrap()),
            diagnostics: Arc::new(MemoryKv::new()),
            dead_letter: Arc::new(MemoryKv::new()),
            metrics: Arc::new(MemoryMetrics::new()),
            config: BatcherConfig {
                max_batch_size: 200,
                batch_interval: Duration::from_millis(50),
                ..Default::default()
            },
        });
        let store = deps.store.clone();
        // Spawned directly: no plan installed
        let handle = spawn("orphan".to_string(), deps);
        handle.add_log(record(1), vec!["log_firehose".to_string()]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Nothing flushed, nothing dropped
        assert!(store
            .first(&Statement::new(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'log_firehose'"
            ))
            .unwrap()
            .is_none());

        // Late plan delivery lets the next alarm (armed by the next add)
        // flush the retained buffer
        let plan_config = Config {
            firehose_table: "log_firehose".to_string(),
            ..Default::default()
        };
        let plan = Arc::new(compile_plan(&plan_config).unwrap());
        handle.set_log_plan(plan).await;
        handle.add_log(record(2), vec!["log_firehose".to_string()]).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(firehose_ids(store.as_ref()).len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_drains_buffers() {
        let h = harness(
            Arc::new(SqliteStore::in_memory().unwrap()),
            BatcherConfig {
                max_batch_size: 200,
                batch_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        let handle = h.registry.instance("batcher-0", &h.plan).await;
        handle.add_log(record(1), vec!["log_firehose".to_string()]).await;
        handle.add_log(record(2), vec!["log_firehose".to_string()]).await;
        h.registry.shutdown_all().await;

        assert_eq!(firehose_ids(h.store.as_ref()).len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retention_check_prunes_and_persists_mark() {
        let store: Arc<dyn LogStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let diagnostics = Arc::new(MemoryKv::new());
        let metrics = Arc::new(MemoryMetrics::new());
        let plan_config = Config {
            firehose_table: "log_firehose".to_string(),
            retention_days: Some(30),
            pruning_interval_days: Some(1),
            ..Default::default()
        };
        let plan = Arc::new(compile_plan(&plan_config).unwrap());
        let registry = BatcherRegistry::new(
            1,
            BatcherDeps {
                store: store.clone(),
                diagnostics: diagnostics.clone(),
                dead_letter: Arc::new(MemoryKv::new()),
                metrics: metrics.clone(),
                config: BatcherConfig::default(),
            },
        );

        // Seed the table with one stale and one fresh row
        schema_mgr::initialize(
            store.as_ref(),
            plan.firehose(),
            metrics.as_ref(),
            None,
        )
        .unwrap();
        let stale = iso8601(Utc::now() - chrono::Duration::days(90));
        let fresh = iso8601(Utc::now());
        store
            .batch(&[
                Statement::new(
                    "INSERT INTO \"log_firehose\" (\"logId\", \"receivedAt\") VALUES (?1, ?2)",
                )
                .bind("stale")
                .bind(stale.as_str()),
                Statement::new(
                    "INSERT INTO \"log_firehose\" (\"logId\", \"receivedAt\") VALUES (?1, ?2)",
                )
                .bind("fresh")
                .bind(fresh.as_str()),
            ])
            .unwrap();

        let handle = registry.pruner_instance("log_firehose", &plan).await;
        handle.set_log_plan(plan.clone()).await;
        handle.run_retention_check("log_firehose").await;

        assert_eq!(firehose_ids(store.as_ref()), vec!["fresh"]);
        assert_eq!(metrics.prunes.load(Ordering::Relaxed), 1);

        let mark = schema_mgr::meta_get(store.as_ref(), "last_pruned_log_firehose")
            .unwrap()
            .expect("last-pruned mark persisted");
        assert!(mark.parse::<i64>().unwrap() > 0);

        let summary = diagnostics.get(diagnostics::PRUNING_SUMMARY).unwrap();
        assert_eq!(summary["log_firehose"]["last_rows_deleted"], 1);

        // Second check inside the interval is a no-op
        handle.run_retention_check("log_firehose").await;
        assert_eq!(metrics.prunes.load(Ordering::Relaxed), 1);

        handle.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_routes_flush_to_their_own_tables() {
        let store: Arc<dyn LogStore> = Arc::new(SqliteStore::in_memory().unwrap());
        let plan_config = Config {
            firehose_table: "log_firehose".to_string(),
            routes: vec![LogRouteConfig {
                table_name: Some("log_slim".to_string()),
                columns: Some(vec![
                    "logId".to_string(),
                    "receivedAt".to_string(),
                    "method".to_string(),
                ]),
                ..Default::default()
            }],
            ..Default::default()
        };
        let plan = Arc::new(compile_plan(&plan_config).unwrap());
        let registry = BatcherRegistry::new(
            1,
            BatcherDeps {
                store: store.clone(),
                diagnostics: Arc::new(MemoryKv::new()),
                dead_letter: Arc::new(MemoryKv::new()),
                metrics: Arc::new(MemoryMetrics::new()),
                config: BatcherConfig {
                    max_batch_size: 1,
                    ..Default::default()
                },
            },
        );

        let handle = registry.instance("batcher-0", &plan).await;
        handle
            .add_log(
                record(1),
                vec!["log_firehose".to_string(), "log_slim".to_string()],
            )
            .await;
        handle.shutdown().await;

        assert_eq!(firehose_ids(store.as_ref()).len(), 1);
        let slim = store
            .all(&Statement::new("SELECT \"logId\", \"method\" FROM \"log_slim\""))
            .unwrap();
        assert_eq!(slim.len(), 1);
        assert_eq!(slim[0].text("method"), Some("GET"));
    }
}
