//! Error types for the logging pipeline
//!
//! Errors are split by where they surface. `ConfigError` stops the plan from
//! compiling and is the only error an embedder ever sees. Everything on the
//! logging path itself (store, schema, assembly) stays internal: those
//! failures are logged, counted, and routed to the dead-letter or
//! diagnostics stores, never returned to the caller of `log`.

use thiserror::Error;

use crate::filter::{FieldType, FilterOp};

/// Invalid route or filter configuration. Fails plan compilation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("log route at index {index} has no table name")]
    MissingTableName { index: usize },

    #[error("`{table}` is not a valid table identifier")]
    InvalidTableName { table: String },

    #[error("log route `{table}`: column `{column}` is not in the master schema")]
    UnknownColumn { table: String, column: String },

    #[error("malformed filter JSON in {source_name}: {message}")]
    MalformedFilterJson {
        source_name: String,
        message: String,
    },

    #[error("failed to read config file {path}: {message}")]
    ConfigFile { path: String, message: String },
}

/// A single route's filter could not be compiled. The route degrades to a
/// deny-all predicate; the rest of the plan stays active.
#[derive(Debug, Error)]
pub enum FilterCompileError {
    #[error("unknown filter field `{key}`")]
    UnknownField { key: String },

    #[error("operator `{op}` is not valid for {ty} field `{key}`")]
    InvalidOperator {
        key: String,
        op: FilterOp,
        ty: FieldType,
    },
}

/// Assembly problems are recorded into the record's `data` field as an
/// `{error, message}` stub; the record itself is never dropped.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("caller data could not be serialized: {0}")]
    DataSerialization(#[from] serde_json::Error),
}
