//! Retention pruner - deletes rows past a route's retention horizon
//!
//! One DELETE bounded by `receivedAt`, then ANALYZE when anything was
//! removed so the store's planner statistics follow the shrinking table.
//! Errors propagate to the batcher, which records the failure and leaves
//! the last-pruned marker untouched for the next cron tick.

use chrono::Utc;

use crate::store::{LogStore, Statement, StoreError};
use crate::util::iso8601;

pub const MS_PER_DAY: i64 = 86_400_000;

/// Delete rows older than `retention_days`, returning how many went.
pub fn prune_table(
    store: &dyn LogStore,
    table: &str,
    retention_days: u32,
) -> Result<u64, StoreError> {
    let cutoff = Utc::now() - chrono::Duration::milliseconds(retention_days as i64 * MS_PER_DAY);
    let cutoff = iso8601(cutoff);

    let deleted = store.execute(
        &Statement::new(format!(
            "DELETE FROM \"{table}\" WHERE \"receivedAt\" < ?1"
        ))
        .bind(cutoff.as_str()),
    )? as u64;

    if deleted > 0 {
        store.exec(&format!("ANALYZE \"{table}\""))?;
    }

    tracing::debug!(table, deleted, cutoff = %cutoff, "retention prune complete");
    Ok(deleted)
}
