//! Logging configuration using tracing.
//!
//! Every run logs to stdout. Live runs additionally append the same
//! timestamped lines, without ANSI colouring, to a per-run log file that the
//! retention pass later rotates.

use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name suffix shared by run logs; rotation matches on it.
pub const RUN_LOG_SUFFIX: &str = "-backup.log";

/// Initialize logging with the specified level and optional run log file
pub fn init(level: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Glob pattern matching every run log in a log directory.
pub fn run_log_pattern() -> String {
    format!("*{}", RUN_LOG_SUFFIX)
}

/// Path of the log file for a run started at `started_at`.
pub fn run_log_path(log_dir: &Path, started_at: DateTime<Local>) -> PathBuf {
    log_dir.join(format!(
        "{}{}",
        started_at.format("%Y-%m-%d_%H-%M-%S"),
        RUN_LOG_SUFFIX
    ))
}
