//! # Logging Setup
//!
//! Installs the global `tracing` subscriber used by the relay binaries:
//!
//! - the level comes from `RUST_LOG` when set, otherwise from the configured
//!   level;
//! - console output is human readable with ANSI colours;
//! - file output is JSON, one object per event, written through a
//!   non-blocking daily rolling appender named after the application.
//!
//! The returned `WorkerGuard` flushes the file writer when dropped, so the
//! caller keeps it alive until the process exits.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Failures while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] io::Error),

    #[error("Invalid log filter '{0}'")]
    InvalidFilter(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Resolves the effective filter: `RUST_LOG` first, then `level`.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|_| LoggingError::InvalidFilter(level.to_string()))
}

/// Installs console and JSON file logging.
pub fn setup_logging(app_name: &str, log_dir: &Path, level: &str) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, format!("{}.log", app_name));
    let (writer, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer().with_ansi(false).with_writer(writer).json();

    tracing_subscriber::registry()
        .with(build_filter(level)?)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))?;

    tracing::info!(level, log_dir = %log_dir.display(), "logging initialized");
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_levels_are_valid_filters() {
        for level in ["trace", "debug", "info", "warn", "error", "lib_relay=debug,info"] {
            assert!(build_filter(level).is_ok(), "{} should parse", level);
        }
    }

    #[test]
    fn creates_log_directory_and_installs_once() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");

        let guard = setup_logging("relay_test", &log_dir, "info").unwrap();
        assert!(log_dir.is_dir());

        match setup_logging("relay_test", &log_dir, "info") {
            Err(LoggingError::AlreadyInstalled(_)) => {}
            other => panic!("expected AlreadyInstalled, got {:?}", other.map(|_| ())),
        }
        drop(guard);
    }
}
