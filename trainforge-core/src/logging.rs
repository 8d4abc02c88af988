//! Tracing setup: human-readable stderr plus optional JSON file logging.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::error::{CoreError, Result};

/// Install the global tracing subscriber.
///
/// The stderr layer honours `config.level`. When `config.log_dir` is set, a
/// second layer writes JSON lines at `debug` into a daily-rolling file; the
/// returned guard flushes it on drop and must be kept alive by the caller.
///
/// Calling this when a global subscriber is already installed is a no-op.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| CoreError::Logging(format!("invalid filter '{}': {e}", config.level)))?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let (json_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed, keeping it");
    }

    Ok(guard)
}
