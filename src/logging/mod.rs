// Logging module - tracing subscriber setup for embedders
//
// The pipeline itself only emits `tracing` events; wiring a subscriber is
// the embedder's choice. This helper builds the common setup: env-filtered
// stdout output plus an optional rolling file layer.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogRotation, LoggingConfig};

/// Initialize the global tracing subscriber.
///
/// Precedence: RUST_LOG env var > config level > "info". Returns the file
/// writer guard when a log directory is configured; hold it for the process
/// lifetime or buffered log lines are lost on exit.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let default_filter = format!("loghose={}", config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let stdout_layer = tracing_subscriber::fmt::layer();

    if let Some(dir) = &config.file_dir {
        let appender = match config.rotation {
            LogRotation::Hourly => tracing_appender::rolling::hourly(dir, "loghose"),
            LogRotation::Daily => tracing_appender::rolling::daily(dir, "loghose"),
            LogRotation::Never => tracing_appender::rolling::never(dir, "loghose.log"),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);

        // try_init so embedders that already installed a subscriber keep it
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
        Some(guard)
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .try_init();
        None
    }
}
