use crate::config::AppConfig;
use crate::core::{Result, StockError};
use std::fs::{self, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "stockroom=info";

/// Installs the global subscriber: `RUST_LOG`-driven filter, console output
/// and a plain-text copy appended to the configured log file.
pub fn init_tracing(config: &AppConfig) -> Result<()> {
    let log_path = config.log_file();
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| StockError::io("create directory", parent, err))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|err| StockError::io("open log file", &log_path, err))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .map_err(|err| StockError::resource("install", "tracing subscriber", err))
}
