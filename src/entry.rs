//! Pipeline entrypoint - the surface an embedding application calls
//!
//! `log` is fire-and-forget: it captures the arrival time, hands the rest
//! to a background task, and returns. The task set is tracked so shutdown
//! can hold the process until in-flight work lands, then drain the batcher
//! instances. Nothing on this path ever returns an error to the caller.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::assemble::Assembler;
use crate::batcher::{BatcherDeps, BatcherRegistry};
use crate::config::Config;
use crate::diagnostics::{KvNamespace, MemoryKv};
use crate::error::ConfigError;
use crate::metrics::{MetricsSink, TracingMetrics};
use crate::plan::{compile_plan, LogPlan};
use crate::record::LogRecord;
use crate::request::{LogRequest, RequestContext};
use crate::store::LogStore;

/// Background task set with an idle barrier: every spawned logging task is
/// held until completion before shutdown proceeds.
#[derive(Default)]
struct TaskGroup {
    active: AtomicUsize,
    idle: Notify,
}

impl TaskGroup {
    fn spawn<F>(self: &Arc<Self>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let group = self.clone();
        tokio::spawn(async move {
            future.await;
            if group.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                group.idle.notify_waiters();
            }
        });
    }

    async fn wait_idle(&self) {
        loop {
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// The request-logging pipeline. Cheap to clone; all clones share the same
/// compiled plan, batcher instances, and background task set.
#[derive(Clone)]
pub struct LogPipeline {
    inner: Arc<PipelineInner>,
    tasks: Arc<TaskGroup>,
}

struct PipelineInner {
    config: Config,
    assembler: Assembler,
    plan: OnceCell<Arc<LogPlan>>,
    registry: BatcherRegistry,
}

impl LogPipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn LogStore>,
        diagnostics: Arc<dyn KvNamespace>,
        dead_letter: Arc<dyn KvNamespace>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let assembler = Assembler::new(config.max_body_size, &config.environment);
        let registry = BatcherRegistry::new(
            config.shard_count,
            BatcherDeps {
                store,
                diagnostics,
                dead_letter,
                metrics,
                config: config.batcher_config(),
            },
        );
        Self {
            inner: Arc::new(PipelineInner {
                config,
                assembler,
                plan: OnceCell::new(),
                registry,
            }),
            tasks: Arc::new(TaskGroup::default()),
        }
    }

    /// Pipeline with in-memory diagnostics/dead-letter namespaces and
    /// tracing-backed metrics - the setup for embedders without external
    /// sinks.
    pub fn with_defaults(config: Config, store: Arc<dyn LogStore>) -> Self {
        Self::new(
            config,
            store,
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryKv::new()),
            Arc::new(TracingMetrics),
        )
    }

    /// Eagerly compile the plan so configuration problems surface at
    /// startup instead of on the first logged request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.inner.plan().map(|_| ())
    }

    /// Fire-and-forget: enqueue this request for logging. Returns
    /// immediately; all failures are observable only through logs, metrics,
    /// and the diagnostics stores.
    pub fn log(&self, request: LogRequest, data: Option<serde_json::Value>) {
        let started = Utc::now();
        let inner = self.inner.clone();
        self.tasks.spawn(async move {
            inner.process(request, data, started).await;
        });
    }

    /// Assemble and return the record without enqueueing it. Debug
    /// affordance for callers inspecting what would be logged.
    pub fn get_log_data(
        &self,
        request: &LogRequest,
        data: Option<&serde_json::Value>,
    ) -> LogRecord {
        let ctx = RequestContext::new(request);
        self.inner.assembler.assemble(&ctx, data, Utc::now())
    }

    /// Cron tick: run the retention check for every route that has both a
    /// horizon and an interval. The plan lands on the pruning instance
    /// before the check runs, and both complete before this returns.
    pub async fn scheduled(&self) {
        self.inner.scheduled().await;
    }

    /// Hold for in-flight logging tasks, then drain every batcher.
    pub async fn shutdown(&self) {
        self.tasks.wait_idle().await;
        self.inner.registry.shutdown_all().await;
        tracing::info!("log pipeline shut down");
    }
}

impl PipelineInner {
    /// Compile (or fetch) the memoized plan.
    fn plan(&self) -> Result<Arc<LogPlan>, ConfigError> {
        self.plan
            .get_or_try_init(|| compile_plan(&self.config).map(Arc::new))
            .cloned()
    }

    async fn process(
        &self,
        request: LogRequest,
        data: Option<serde_json::Value>,
        started: DateTime<Utc>,
    ) {
        let plan = match self.plan() {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(error = %e, "log plan failed to compile; request not logged");
                return;
            }
        };

        let ctx = RequestContext::new(&request);
        let record = self.assembler.assemble(&ctx, data.as_ref(), started);

        let matched: Vec<String> = plan
            .routes()
            .iter()
            .filter(|route| (route.predicate)(&ctx))
            .map(|route| route.table_name.clone())
            .collect();
        if matched.is_empty() {
            tracing::trace!(log_id = %record.log_id(), "no routes matched");
            return;
        }

        // Ray id keys the shard so a retried request lands on the same
        // instance; the log id stands in when the edge did not supply one.
        let shard_key = request
            .headers
            .get("cf-ray")
            .map(str::to_string)
            .unwrap_or_else(|| record.log_id().to_string());

        self.registry
            .dispatch(&plan, &shard_key, record, matched)
            .await;
    }

    async fn scheduled(&self) {
        let plan = match self.plan() {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(error = %e, "log plan failed to compile; skipping retention");
                return;
            }
        };

        for route in plan.routes() {
            if route.retention_days.is_none() || route.pruning_interval_days.is_none() {
                continue;
            }
            let handle = self.registry.pruner_instance(&route.table_name, &plan).await;
            handle.set_log_plan(plan.clone()).await;
            handle.run_retention_check(route.table_name.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MemoryMetrics;
    use crate::plan::LogRouteConfig;
    use crate::schema_mgr;
    use crate::store::{SqliteStore, Statement};
    use serde_json::json;

    struct Harness {
        pipeline: LogPipeline,
        store: Arc<SqliteStore>,
        metrics: Arc<MemoryMetrics>,
    }

    fn harness(config: Config) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let metrics = Arc::new(MemoryMetrics::new());
        let pipeline = LogPipeline::new(
            config,
            store.clone(),
            Arc::new(MemoryKv::new()),
            Arc::new(MemoryKv::new()),
            metrics.clone(),
        );
        Harness {
            pipeline,
            store,
            metrics,
        }
    }

    fn count(store: &SqliteStore, table: &str) -> i64 {
        store
            .first(&Statement::new(format!("SELECT COUNT(*) AS c FROM \"{table}\"")))
            .unwrap()
            .unwrap()
            .integer("c")
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_records_route_by_predicate() {
        let mut config = Config {
            max_batch_size: 1, // every add flushes immediately
            ..Default::default()
        };
        config.routes = vec![LogRouteConfig {
            table_name: Some("log_api".to_string()),
            filter: serde_json::from_value(json!([{"url.pathname": {"startsWith": "/api"}}]))
                .unwrap(),
            columns: Some(vec![
                "logId".to_string(),
                "receivedAt".to_string(),
                "urlPathname".to_string(),
            ]),
            ..Default::default()
        }];
        let h = harness(config);

        h.pipeline
            .log(LogRequest::new("GET", "https://example.com/api/users"), None);
        h.pipeline
            .log(LogRequest::new("GET", "https://example.com/home"), None);
        h.pipeline.shutdown().await;

        // Both requests hit the firehose; only the /api one hit log_api
        assert_eq!(count(&h.store, "log_firehose"), 2);
        assert_eq!(count(&h.store, "log_api"), 1);
        let row = h
            .store
            .first(&Statement::new("SELECT \"urlPathname\" FROM \"log_api\""))
            .unwrap()
            .unwrap();
        assert_eq!(row.text("urlPathname"), Some("/api/users"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_caller_data_lands_in_firehose() {
        let h = harness(Config {
            max_batch_size: 1,
            ..Default::default()
        });
        h.pipeline.log(
            LogRequest::new("POST", "https://example.com/checkout"),
            Some(json!({"orderId": 42})),
        );
        h.pipeline.shutdown().await;

        let row = h
            .store
            .first(&Statement::new("SELECT \"data\", \"method\" FROM \"log_firehose\""))
            .unwrap()
            .unwrap();
        assert_eq!(row.text("method"), Some("POST"));
        assert_eq!(row.text("data"), Some("{\"orderId\":42}"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_log_data_does_not_enqueue() {
        let h = harness(Config {
            max_batch_size: 1,
            ..Default::default()
        });
        let record = h
            .pipeline
            .get_log_data(&LogRequest::new("GET", "https://example.com/x"), None);
        assert!(!record.log_id().is_empty());
        assert_eq!(record.get_str("method"), Some("GET"));
        h.pipeline.shutdown().await;

        // Nothing was written; the table was never even created
        let table = h
            .store
            .first(
                &Statement::new(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'log_firehose'",
                ),
            )
            .unwrap();
        assert!(table.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broken_plan_never_reaches_caller() {
        let config = Config {
            routes: vec![LogRouteConfig::default()], // missing tableName
            ..Default::default()
        };
        let h = harness(config);
        assert!(h.pipeline.validate().is_err());

        // log() still returns; the failure stays internal
        h.pipeline
            .log(LogRequest::new("GET", "https://example.com/"), None);
        h.pipeline.shutdown().await;
        assert_eq!(h.metrics.points().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_flushes_buffered_records() {
        // Large batch size and long interval: only the drain can flush
        let h = harness(Config {
            max_batch_size: 200,
            batch_interval_ms: 3_600_000,
            ..Default::default()
        });
        for _ in 0..5 {
            h.pipeline
                .log(LogRequest::new("GET", "https://example.com/"), None);
        }
        h.pipeline.shutdown().await;
        assert_eq!(count(&h.store, "log_firehose"), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scheduled_initializes_and_marks_pruned() {
        let config = Config {
            retention_days: Some(30),
            pruning_interval_days: Some(1),
            ..Default::default()
        };
        let h = harness(config);
        h.pipeline.scheduled().await;

        // Schema init ran on the pruning instance and the mark advanced
        assert_eq!(count(&h.store, "log_firehose"), 0);
        let mark = schema_mgr::meta_get(h.store.as_ref(), "last_pruned_log_firehose")
            .unwrap()
            .expect("last-pruned mark");
        assert!(mark.parse::<i64>().unwrap() > 0);
        assert_eq!(
            h.metrics.prunes.load(std::sync::atomic::Ordering::Relaxed),
            1
        );

        // A second tick inside the interval does nothing
        h.pipeline.scheduled().await;
        assert_eq!(
            h.metrics.prunes.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        h.pipeline.shutdown().await;
    }
}
