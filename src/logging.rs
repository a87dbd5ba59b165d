//! Tracing initialization for the relay daemon.
//!
//! The relay runs detached with stdio closed, so file logging is the only
//! way to observe it. When `CDP_RELAY_LOG_FILE` is set, log lines go through
//! a non-blocking appender to that file; otherwise they go to stderr (useful
//! when running the binary in the foreground).
//!
//! Filtering follows `RUST_LOG` with an `info`-level default.

// ============================================================================
// Imports
// ============================================================================

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;
use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_FILTER: &str = "info,tower_http=warn,hyper=warn";

// ============================================================================
// Init
// ============================================================================

/// Initializes the global tracing subscriber.
///
/// Returns the appender guard when logging to a file; the guard must stay
/// alive for the process lifetime or buffered lines are lost.
///
/// # Errors
///
/// Returns [`Error::Config`] when the log file's parent directory cannot be
/// created.
pub fn init_logging(config: &RelayConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match &config.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            if let Some(dir) = dir {
                std::fs::create_dir_all(dir).map_err(|e| {
                    Error::config(format!("cannot create log directory {}: {e}", dir.display()))
                })?;
            }
            let file_name = path
                .file_name()
                .ok_or_else(|| Error::config(format!("invalid log file path: {}", path.display())))?;
            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
                .init();

            tracing::info!(log_file = %path.display(), "Logging to file");
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
                .init();
            Ok(None)
        }
    }
}
