//! Operational metrics - batch writes, schema migrations, data pruning
//!
//! The sink is a seam: production embedders forward to whatever analytics
//! backend they have; the default [`TracingMetrics`] emits structured
//! tracing events; [`MemoryMetrics`] records everything for assertions.
//! Emission is fire-and-forget and must never fail the calling path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Outcome tag shared by batch writes and pruning runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    Failure,
}

impl WriteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            WriteOutcome::Success => "success",
            WriteOutcome::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationType {
    CreateTable,
    AlterTable,
}

impl MigrationType {
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationType::CreateTable => "create_table",
            MigrationType::AlterTable => "alter_table",
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn batch_write(
        &self,
        table: &str,
        outcome: WriteOutcome,
        colo: Option<&str>,
        batch_size: usize,
        duration_ms: u64,
    );

    fn schema_migration(
        &self,
        table: &str,
        migration_type: MigrationType,
        schema_hash: &str,
        colo: Option<&str>,
        duration_ms: u64,
    );

    fn data_pruning(
        &self,
        table: &str,
        outcome: WriteOutcome,
        colo: Option<&str>,
        rows_deleted: u64,
        duration_ms: u64,
    );
}

/// Default sink: one structured tracing event per data point.
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn batch_write(
        &self,
        table: &str,
        outcome: WriteOutcome,
        colo: Option<&str>,
        batch_size: usize,
        duration_ms: u64,
    ) {
        tracing::info!(
            dataset = "batchWrites",
            table,
            outcome = outcome.as_str(),
            colo,
            batch_size,
            duration_ms,
            write_count = 1,
            "batch write"
        );
    }

    fn schema_migration(
        &self,
        table: &str,
        migration_type: MigrationType,
        schema_hash: &str,
        colo: Option<&str>,
        duration_ms: u64,
    ) {
        tracing::info!(
            dataset = "schemaMigrations",
            table,
            migration_type = migration_type.as_str(),
            schema_hash,
            colo,
            duration_ms,
            migration_count = 1,
            "schema migration"
        );
    }

    fn data_pruning(
        &self,
        table: &str,
        outcome: WriteOutcome,
        colo: Option<&str>,
        rows_deleted: u64,
        duration_ms: u64,
    ) {
        tracing::info!(
            dataset = "dataPruning",
            table,
            outcome = outcome.as_str(),
            colo,
            rows_deleted,
            duration_ms,
            prune_count = 1,
            "data pruning"
        );
    }
}

/// One recorded point, kept by [`MemoryMetrics`] for test assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedPoint {
    BatchWrite {
        table: String,
        outcome: WriteOutcome,
        batch_size: usize,
    },
    SchemaMigration {
        table: String,
        migration_type: MigrationType,
        schema_hash: String,
    },
    DataPruning {
        table: String,
        outcome: WriteOutcome,
        rows_deleted: u64,
    },
}

/// Counting sink with a full point log.
#[derive(Default)]
pub struct MemoryMetrics {
    pub writes_success: AtomicU64,
    pub writes_failure: AtomicU64,
    pub migrations: AtomicU64,
    pub prunes: AtomicU64,
    points: Mutex<Vec<RecordedPoint>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<RecordedPoint> {
        self.points.lock().unwrap().clone()
    }

    pub fn migrations_for(&self, table: &str) -> Vec<RecordedPoint> {
        self.points()
            .into_iter()
            .filter(|p| matches!(p, RecordedPoint::SchemaMigration { table: t, .. } if t == table))
            .collect()
    }
}

impl MetricsSink for MemoryMetrics {
    fn batch_write(
        &self,
        table: &str,
        outcome: WriteOutcome,
        _colo: Option<&str>,
        batch_size: usize,
        _duration_ms: u64,
    ) {
        match outcome {
            WriteOutcome::Success => self.writes_success.fetch_add(1, Ordering::Relaxed),
            WriteOutcome::Failure => self.writes_failure.fetch_add(1, Ordering::Relaxed),
        };
        self.points.lock().unwrap().push(RecordedPoint::BatchWrite {
            table: table.to_string(),
            outcome,
            batch_size,
        });
    }

    fn schema_migration(
        &self,
        table: &str,
        migration_type: MigrationType,
        schema_hash: &str,
        _colo: Option<&str>,
        _duration_ms: u64,
    ) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
        self.points
            .lock()
            .unwrap()
            .push(RecordedPoint::SchemaMigration {
                table: table.to_string(),
                migration_type,
                schema_hash: schema_hash.to_string(),
            });
    }

    fn data_pruning(
        &self,
        table: &str,
        outcome: WriteOutcome,
        _colo: Option<&str>,
        rows_deleted: u64,
        _duration_ms: u64,
    ) {
        self.prunes.fetch_add(1, Ordering::Relaxed);
        self.points.lock().unwrap().push(RecordedPoint::DataPruning {
            table: table.to_string(),
            outcome,
            rows_deleted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_metrics_counts_and_points() {
        let metrics = MemoryMetrics::new();
        metrics.batch_write("t", WriteOutcome::Success, Some("AMS"), 3, 12);
        metrics.batch_write("t", WriteOutcome::Failure, None, 3, 20);
        metrics.schema_migration("t", MigrationType::CreateTable, "abcd", None, 5);

        assert_eq!(metrics.writes_success.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.writes_failure.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.migrations.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.points().len(), 3);
        assert_eq!(metrics.migrations_for("t").len(), 1);
        assert_eq!(metrics.migrations_for("other").len(), 0);
    }
}
