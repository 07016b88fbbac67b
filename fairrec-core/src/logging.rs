//! Logging initialisation.
//!
//! Installs a human-readable stderr layer and, when a log directory is given,
//! a JSON layer behind a daily rolling non-blocking file appender.

use crate::error::CoreError;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// File name prefix for the rolling JSON log.
pub const LOG_FILE_PREFIX: &str = "fairrec.log";

/// Map CLI verbosity flags to a filter directive.
pub fn level_for(verbosity: u8, quiet: bool) -> &'static str {
    match verbosity {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// Returns the file appender guard when JSON logging is enabled; dropping it
/// flushes and stops the background writer, so the caller must hold it for
/// the lifetime of the process.
pub fn init_logging(
    verbosity: u8,
    quiet: bool,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, CoreError> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(level_for(verbosity, quiet)));

    let (json_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| CoreError::logging(e.to_string()))?;

    Ok(guard)
}
