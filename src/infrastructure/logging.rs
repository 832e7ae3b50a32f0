//! Tracing setup.
//!
//! Json or pretty output with an `EnvFilter` seeded from the configured
//! level; `RUST_LOG` still wins when set. With a log directory configured,
//! output goes to a daily-rolled file through a non-blocking writer.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use crate::domain::models::LoggingConfig;

/// Initialise the global tracing subscriber. Call once at startup.
///
/// The returned guard, when present, must be held for the lifetime of the
/// process so buffered file output flushes on shutdown.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("runnerhub={}", config.level)));

    let (writer, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "runnerhub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, Some(guard))
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, Some(guard))
        }
    };

    match config.format.as_str() {
        "pretty" => {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_target(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .json()
                .with_current_span(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))?;
        }
    }
    Ok(guard)
}
