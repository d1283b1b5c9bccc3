use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

use crate::config::env_truthy;
use crate::errors::{Result, UpdaterError};

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

const LOG_FILE_PREFIX: &str = "updater.log";
const FILTER_ENV: &str = "UPDATER_LOG";
const STDERR_ENV: &str = "UPDATER_LOG_STDERR";

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber: a daily-rolled `updater.log` in
/// `log_dir`, mirrored to stderr when `UPDATER_LOG_STDERR` is set.
/// `UPDATER_LOG` (or `RUST_LOG`) overrides the `info` default filter.
pub fn init(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        return Err(UpdaterError::Config("logging already initialised".to_string()));
    }

    let writer = if env_truthy(&|key: &str| std::env::var(key).ok(), STDERR_ENV) {
        BoxMakeWriter::new(non_blocking.and(std::io::stderr))
    } else {
        BoxMakeWriter::new(non_blocking)
    };

    let subscriber = Subscriber::builder()
        .with_env_filter(filter_from_env())
        .with_writer(writer)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| UpdaterError::Config(err.to_string()))?;

    Ok(())
}
