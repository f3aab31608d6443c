//! SQLite implementation of the store interface
//!
//! Uses an r2d2 connection pool so concurrent per-table flushes each get
//! their own connection. WAL mode keeps readers and the single writer out
//! of each other's way.

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::ToSql;
use std::path::Path;

use super::{LogStore, Row, SqlValue, Statement, StoreError};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Bool(b) => ToSqlOutput::Owned(Value::Integer(*b as i64)),
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
        })
    }
}

fn value_from_ref(value: ValueRef<'_>) -> SqlValue {
    match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(i) => SqlValue::Integer(i),
        ValueRef::Real(f) => SqlValue::Real(f),
        ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => SqlValue::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

pub struct SqliteStore {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) a database file with the pipeline's pragmas.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                "#,
            )
        });
        let pool = r2d2::Pool::builder().build(manager)?;
        Ok(Self { pool })
    }

    /// In-memory database on a single pooled connection. Multiple pooled
    /// in-memory connections would each see their own database, so the pool
    /// is capped at one.
    pub fn in_memory() -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager)?;
        Ok(Self { pool })
    }

    fn query(
        &self,
        statement: &Statement,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&statement.sql)?;
        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut rows = stmt.query(rusqlite::params_from_iter(statement.params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = std::collections::HashMap::with_capacity(column_names.len());
            for (i, name) in column_names.iter().enumerate() {
                map.insert(name.clone(), value_from_ref(row.get_ref(i)?));
            }
            out.push(Row(map));
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
        }
        Ok(out)
    }
}

impl LogStore for SqliteStore {
    fn batch(&self, statements: &[Statement]) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        for statement in statements {
            tx.execute(
                &statement.sql,
                rusqlite::params_from_iter(statement.params.iter()),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn exec(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn execute(&self, statement: &Statement) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let changes = conn.execute(
            &statement.sql,
            rusqlite::params_from_iter(statement.params.iter()),
        )?;
        Ok(changes)
    }

    fn first(&self, statement: &Statement) -> Result<Option<Row>, StoreError> {
        Ok(self.query(statement, Some(1))?.into_iter().next())
    }

    fn all(&self, statement: &Statement) -> Result<Vec<Row>, StoreError> {
        self.query(statement, None)
    }
}
