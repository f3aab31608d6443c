//! Configuration for the logging pipeline
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`LOGHOSE_CONFIG` path, or ~/.config/loghose/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! Numeric tuning values are parsed defensively: anything non-numeric or
//! non-positive reverts to the default with a warning rather than taking
//! the pipeline down.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::batcher::BatcherConfig;
use crate::error::ConfigError;
use crate::filter::{parse_filter_json, FilterGroup};
use crate::plan::LogRouteConfig;

// ─────────────────────────────────────────────────────────────────────────────
// Logging configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Rotation cadence for the optional log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Tracing output for the pipeline. Stdout is always on; setting `file_dir`
/// adds a rolling file writer, typically pointed next to the batch store so
/// pipeline logs and data share a volume. An unknown `rotation` value fails
/// config-file parsing like any other bad setting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for the pipeline's own events when RUST_LOG is unset
    pub level: String,
    /// Directory for rolling `loghose.*` log files; unset disables file
    /// output
    pub file_dir: Option<PathBuf>,
    pub rotation: LogRotation,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
            rotation: LogRotation::Daily,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    /// Firehose destination table (every request lands here)
    pub firehose_table: String,

    /// Optional filter narrowing the firehose
    pub firehose_filters: Option<Vec<FilterGroup>>,

    /// Firehose retention horizon in days
    pub retention_days: Option<u32>,

    /// How often the firehose is pruned, in days
    pub pruning_interval_days: Option<u32>,

    /// Alarm interval for time-based flushes
    pub batch_interval_ms: u64,

    /// Buffer size that triggers an immediate flush
    pub max_batch_size: usize,

    /// Captured request-body budget, in characters
    pub max_body_size: usize,

    /// Number of ingest batcher instances
    pub shard_count: u32,

    /// User-defined routes, appended after the firehose in order
    pub routes: Vec<LogRouteConfig>,

    /// Caller environment snapshot; only scalar entries are recorded
    pub environment: serde_json::Map<String, serde_json::Value>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            firehose_table: "log_firehose".to_string(),
            firehose_filters: None,
            retention_days: None,
            pruning_interval_days: None,
            batch_interval_ms: 10_000,
            max_batch_size: 200,
            max_body_size: 100_000,
            shard_count: 4,
            routes: Vec::new(),
            environment: serde_json::Map::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Batcher tuning derived from the parsed values.
    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            batch_interval: Duration::from_millis(self.batch_interval_ms),
            max_batch_size: self.max_batch_size,
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub firehose_table: Option<String>,
    pub firehose_filters: Option<Vec<FilterGroup>>,
    pub retention_days: Option<u32>,
    pub pruning_interval_days: Option<u32>,
    pub batch_interval_ms: Option<i64>,
    pub max_batch_size: Option<i64>,
    pub max_body_size: Option<i64>,
    pub shard_count: Option<i64>,

    /// Optional [[routes]] array
    #[serde(default)]
    pub routes: Vec<LogRouteConfig>,

    /// Optional [environment] section of scalar bindings
    #[serde(default)]
    pub environment: serde_json::Map<String, serde_json::Value>,

    /// Optional [logging] section
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration loading
// ─────────────────────────────────────────────────────────────────────────────

/// Parse a positive integer, reverting to `default` on garbage.
fn parse_positive(raw: Option<&str>, name: &str, default: u64) -> u64 {
    let Some(raw) = raw else { return default };
    match raw.trim().parse::<i64>() {
        Ok(v) if v > 0 => v as u64,
        _ => {
            tracing::warn!(
                setting = name,
                value = raw,
                default,
                "ignoring non-positive or non-numeric setting"
            );
            default
        }
    }
}

fn parse_days(raw: Option<&str>, name: &str) -> Option<u32> {
    let raw = raw?;
    match raw.trim().parse::<i64>() {
        Ok(v) if v > 0 => Some(v as u32),
        _ => {
            tracing::warn!(setting = name, value = raw, "ignoring invalid day count");
            None
        }
    }
}

impl Config {
    /// Get the config file path: `LOGHOSE_CONFIG` if set, otherwise
    /// ~/.config/loghose/config.toml
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LOGHOSE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|p| p.join(".config").join("loghose").join("config.toml"))
    }

    fn load_file_config() -> Result<FileConfig, ConfigError> {
        let Some(path) = Self::config_path() else {
            return Ok(FileConfig::default());
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                toml::from_str(&contents).map_err(|e| ConfigError::ConfigFile {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => Err(ConfigError::ConfigFile {
                path: path.display().to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Load configuration: env vars over file over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let file = Self::load_file_config()?;
        let env = |name: &str| std::env::var(name).ok();
        Self::from_sources(file, &env)
    }

    fn from_sources(
        file: FileConfig,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let firehose_table = env("LOG_HOSE_TABLE")
            .filter(|t| !t.is_empty())
            .or(file.firehose_table)
            .unwrap_or(defaults.firehose_table);

        // Env filter JSON wins over the structured file section
        let firehose_filters = match env("LOG_HOSE_FILTERS") {
            Some(raw) => Some(parse_filter_json(&raw).map_err(|e| {
                ConfigError::MalformedFilterJson {
                    source_name: "LOG_HOSE_FILTERS".to_string(),
                    message: e.to_string(),
                }
            })?),
            None => file.firehose_filters,
        };

        let retention_days = parse_days(
            env("LOG_HOSE_RETENTION_DAYS").as_deref(),
            "LOG_HOSE_RETENTION_DAYS",
        )
        .or(file.retention_days);
        let pruning_interval_days = parse_days(
            env("LOG_HOSE_PRUNING_INTERVAL_DAYS").as_deref(),
            "LOG_HOSE_PRUNING_INTERVAL_DAYS",
        )
        .or(file.pruning_interval_days);

        // File values run through the same defensive parse as env values
        let file_num = |v: Option<i64>| v.map(|n| n.to_string());
        let batch_interval_ms = parse_positive(
            env("BATCH_INTERVAL_MS")
                .or(file_num(file.batch_interval_ms))
                .as_deref(),
            "BATCH_INTERVAL_MS",
            defaults.batch_interval_ms,
        );
        let max_batch_size = parse_positive(
            env("MAX_BATCH_SIZE")
                .or(file_num(file.max_batch_size))
                .as_deref(),
            "MAX_BATCH_SIZE",
            defaults.max_batch_size as u64,
        ) as usize;
        let max_body_size = parse_positive(
            env("MAX_BODY_SIZE")
                .or(file_num(file.max_body_size))
                .as_deref(),
            "MAX_BODY_SIZE",
            defaults.max_body_size as u64,
        ) as usize;
        let shard_count = parse_positive(
            env("LOG_SHARD_COUNT")
                .or(file_num(file.shard_count))
                .as_deref(),
            "LOG_SHARD_COUNT",
            defaults.shard_count as u64,
        ) as u32;

        Ok(Self {
            firehose_table,
            firehose_filters,
            retention_days,
            pruning_interval_days,
            batch_interval_ms,
            max_batch_size,
            max_body_size,
            shard_count,
            routes: file.routes,
            environment: file.environment,
            logging: file.logging,
        })
    }
}
