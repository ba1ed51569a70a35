//! File logging for fleetctl. Stdout is reserved for command output.

use fs_err as fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "fleetctl.log";

/// Installs a daily-rolling file subscriber. The returned guard flushes
/// buffered lines on drop and must live as long as the process.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    if let Err(err) = fs::create_dir_all(&dir) {
        eprintln!("fleetctl: logging disabled: {}", err);
        return None;
    }

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".botfleet").join("logs"))
}
