//! Logging setup.

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use workshop_shared::errors::{WorkshopError, WorkshopResult};

use crate::runtime::WorkshopLayout;

/// Rolling log file name under `<home>/logs`.
pub const LOG_FILE: &str = "workshop.log";

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber writing to `non_blocking`.
///
/// With `stderr` set, events are also printed to the terminal. A subscriber
/// that is already installed is left in place.
pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter, stderr: bool) {
    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(false);
    let stderr_layer = stderr.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init();
}

/// Log to daily rolling files in the layout's logs directory.
///
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init_logging_for(layout: &WorkshopLayout, stderr: bool) -> WorkshopResult<WorkerGuard> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir)
        .map_err(|e| WorkshopError::Storage(format!("failed to create logs dir: {e}")))?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    register_to_tracing(non_blocking, env_filter(), stderr);
    Ok(guard)
}
