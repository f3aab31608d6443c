//! Schema manager - idempotent table creation and additive migration
//!
//! Each destination table's DDL is gated by a fingerprint persisted in the
//! `loghose_meta` table. Matching fingerprint: zero DDL. Changed
//! fingerprint: CREATE TABLE when the table is absent, otherwise additive
//! `ALTER TABLE ... ADD COLUMN` plus any missing indexes. Columns are never
//! dropped or renamed.

use std::collections::HashSet;
use std::time::Instant;
use thiserror::Error;

use crate::metrics::{MetricsSink, MigrationType};
use crate::plan::CompiledLogRoute;
use crate::schema::Column;
use crate::store::{LogStore, Statement, StoreError};

/// Durable pipeline state lives here, next to the data it describes.
pub const META_TABLE: &str = "loghose_meta";

pub fn schema_hash_key(table: &str) -> String {
    format!("schema_hash_{table}")
}

pub fn last_pruned_key(table: &str) -> String {
    format!("last_pruned_{table}")
}

/// DDL or catalog failure. Fatal to the migration; the batcher treats it as
/// a flush failure and retries the whole flush later.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema statement failed: {statement}: {source}")]
    Ddl {
        statement: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn ddl(store: &dyn LogStore, sql: &str) -> Result<(), SchemaError> {
    store.exec(sql).map_err(|source| {
        tracing::error!(statement = %sql, error = %source, "schema statement failed");
        SchemaError::Ddl {
            statement: sql.to_string(),
            source,
        }
    })
}

pub fn ensure_meta_table(store: &dyn LogStore) -> Result<(), SchemaError> {
    ddl(
        store,
        &format!("CREATE TABLE IF NOT EXISTS {META_TABLE} (key TEXT PRIMARY KEY, value TEXT)"),
    )
}

pub fn meta_get(store: &dyn LogStore, key: &str) -> Result<Option<String>, SchemaError> {
    let row = store.first(
        &Statement::new(format!("SELECT value FROM {META_TABLE} WHERE key = ?1")).bind(key),
    )?;
    Ok(row.and_then(|r| r.text("value").map(str::to_string)))
}

pub fn meta_put(store: &dyn LogStore, key: &str, value: &str) -> Result<(), SchemaError> {
    store.execute(
        &Statement::new(format!(
            "INSERT INTO {META_TABLE} (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ))
        .bind(key)
        .bind(value),
    )?;
    Ok(())
}

/// Bring `route`'s table up to the route's schema if the stored fingerprint
/// says it is out of date. Emits one migration metric per actual migration.
pub fn initialize(
    store: &dyn LogStore,
    route: &CompiledLogRoute,
    metrics: &dyn MetricsSink,
    colo: Option<&str>,
) -> Result<(), SchemaError> {
    ensure_meta_table(store)?;

    let key = schema_hash_key(&route.table_name);
    let stored = meta_get(store, &key)?;
    if stored.as_deref() == Some(route.schema_hash.as_str()) {
        return Ok(());
    }

    let start = Instant::now();
    apply_schema(store, &route.table_name, &route.schema)?;
    meta_put(store, &key, &route.schema_hash)?;

    let migration_type = if stored.is_none() {
        MigrationType::CreateTable
    } else {
        MigrationType::AlterTable
    };
    metrics.schema_migration(
        &route.table_name,
        migration_type,
        &route.schema_hash,
        colo,
        start.elapsed().as_millis() as u64,
    );
    tracing::info!(
        table = %route.table_name,
        migration = migration_type.as_str(),
        schema_hash = %route.schema_hash,
        "schema migrated"
    );
    Ok(())
}

/// Create or additively migrate one table to `schema`.
pub fn apply_schema(
    store: &dyn LogStore,
    table: &str,
    schema: &[Column],
) -> Result<(), SchemaError> {
    let exists = store
        .first(
            &Statement::new("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
                .bind(table),
        )?
        .is_some();

    if !exists {
        let columns: Vec<String> = schema.iter().map(Column::definition).collect();
        // IF NOT EXISTS: another instance may win the creation race, and
        // that is fine
        ddl(
            store,
            &format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" ({})",
                columns.join(", ")
            ),
        )?;
        create_missing_indexes(store, table, schema, &HashSet::new())?;
        return Ok(());
    }

    // Additive migration: add whatever the catalog is missing.
    let existing: HashSet<String> = store
        .all(&Statement::new(format!("PRAGMA table_info(\"{table}\")")))?
        .iter()
        .filter_map(|row| row.text("name").map(str::to_string))
        .collect();

    let alters: Vec<Statement> = schema
        .iter()
        .filter(|col| !existing.contains(col.name))
        .map(|col| {
            Statement::new(format!(
                "ALTER TABLE \"{table}\" ADD COLUMN {}",
                col.definition()
            ))
        })
        .collect();
    if !alters.is_empty() {
        store.batch(&alters).map_err(|source| {
            let statement = alters
                .iter()
                .map(|s| s.sql.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            tracing::error!(statement = %statement, error = %source, "schema statement failed");
            SchemaError::Ddl { statement, source }
        })?;
    }

    let existing_indexes: HashSet<String> = store
        .all(
            &Statement::new("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1")
                .bind(table),
        )?
        .iter()
        .filter_map(|row| row.text("name").map(str::to_string))
        .collect();
    create_missing_indexes(store, table, schema, &existing_indexes)?;

    Ok(())
}

fn create_missing_indexes(
    store: &dyn LogStore,
    table: &str,
    schema: &[Column],
    existing: &HashSet<String>,
) -> Result<(), SchemaError> {
    for col in schema.iter().filter(|c| c.indexed) {
        let index = col.index_name();
        if existing.contains(&index) {
            continue;
        }
        ddl(
            store,
            &format!(
                "CREATE INDEX IF NOT EXISTS \"{index}\" ON \"{table}\" (\"{}\")",
                col.name
            ),
        )?;
    }
    Ok(())
}
