//! Tracing setup for embedding applications.
//!
//! The library itself only emits `tracing` events; hosts that want them on
//! disk call [`init_file_logging`] once at startup. Returns the appender
//! guard, which must be held for the lifetime of the process or buffered
//! lines are lost on exit.

use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Initializes a non-blocking file subscriber filtered by `RILL_LOG`
/// (falling back to `info`).
pub fn init_file_logging(dir: &Path, file_name: &str) -> Result<WorkerGuard> {
    let appender = tracing_appender::rolling::daily(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env("RILL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}
