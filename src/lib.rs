// loghose - fire-and-forget request logging to a relational store
//
// An embedding application hands each incoming request (plus an optional
// data payload) to the pipeline; the pipeline enriches it into a structured
// record, routes it through a compiled plan of destination tables, and
// batches writes for throughput.
//
// Architecture:
// - Plan compiler: declarative routes + filters -> compiled predicates
// - Assembler: request -> flat record (hashes, buckets, geo id, body)
// - Shard dispatcher: deterministic record -> batcher instance mapping
// - Batcher instances: per-table buffers, alarm/size flushes, retry,
//   dead-letter quarantine, retention pruning
// - Schema manager: fingerprint-gated CREATE / additive ALTER
// - Diagnostics + metrics: fire-and-forget observability sinks

pub mod assemble;
pub mod batcher;
pub mod config;
pub mod diagnostics;
pub mod entry;
pub mod error;
pub mod filter;
pub mod logging;
pub mod metrics;
pub mod plan;
pub mod prune;
pub mod record;
pub mod request;
pub mod schema;
pub mod schema_mgr;
pub mod store;
pub mod util;

pub use config::Config;
pub use entry::LogPipeline;
pub use error::ConfigError;
pub use record::LogRecord;
pub use request::{EdgeData, LogRequest};
pub use store::{LogStore, SqliteStore};
