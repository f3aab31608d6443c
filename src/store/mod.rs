//! Narrow store interface - the only surface the pipeline talks SQL through
//!
//! The batcher, schema manager, and pruner all speak through [`LogStore`]:
//! parameterized statements submitted one at a time or as a single batched
//! transaction, plus DDL and catalog reads. The expected dialect is
//! SQLite-compatible (`PRAGMA table_info`, `sqlite_master`, `ANALYZE`).

use std::collections::HashMap;
use thiserror::Error;

use crate::record::FieldValue;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Null,
}

impl From<&FieldValue> for SqlValue {
    fn from(v: &FieldValue) -> Self {
        match v {
            FieldValue::Str(s) => SqlValue::Text(s.clone()),
            FieldValue::Int(i) => SqlValue::Integer(*i),
            FieldValue::Bool(b) => SqlValue::Bool(*b),
            FieldValue::Null => SqlValue::Null,
        }
    }
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            SqlValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }
}

/// A parameterized SQL statement: `prepare(sql).bind(...)` in value form.
#[derive(Debug, Clone)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

/// One result row, keyed by column name.
#[derive(Debug, Clone, Default)]
pub struct Row(pub HashMap<String, SqlValue>);

impl Row {
    pub fn text(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(SqlValue::as_text)
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        self.0.get(column).and_then(SqlValue::as_integer)
    }
}

/// Store failures. Writes through the batcher are treated as transient and
/// retried; everything else propagates to the caller that issued the call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// The store seam. Implementations must be safe to share across the
/// blocking worker threads that carry flushes.
pub trait LogStore: Send + Sync {
    /// Execute all statements as a single transactional batch.
    fn batch(&self, statements: &[Statement]) -> Result<(), StoreError>;

    /// Execute raw SQL (DDL) with no parameters.
    fn exec(&self, sql: &str) -> Result<(), StoreError>;

    /// Execute one statement, returning the number of affected rows.
    fn execute(&self, statement: &Statement) -> Result<usize, StoreError>;

    /// First result row, if any.
    fn first(&self, statement: &Statement) -> Result<Option<Row>, StoreError>;

    /// All result rows.
    fn all(&self, statement: &Statement) -> Result<Vec<Row>, StoreError>;
}
