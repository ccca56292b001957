use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "USAGE_BOARD_LOG";

pub fn dashboard_log_path() -> PathBuf {
    ProjectDirs::from("com", "usage-board", "usage-board")
        .map(|dirs| dirs.cache_dir().join("dashboard.log"))
        .unwrap_or_else(|| std::env::temp_dir().join("usage-board-dashboard.log"))
}

pub enum LogSink<'a> {
    Stderr,
    /// Used while the dashboard owns the terminal.
    File(&'a Path),
}

/// Verbosity flags win over the configured level.
pub fn default_level(verbose: u8, configured: Option<&str>) -> String {
    match verbose {
        0 => configured.unwrap_or("warn").to_string(),
        1 => "info".to_string(),
        _ => "debug".to_string(),
    }
}

pub fn init(level: &str, sink: LogSink<'_>) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match sink {
        LogSink::Stderr => {
            let _ = registry
                .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
                .try_init();
        }
        LogSink::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log dir {}", parent.display()))?;
            }
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let _ = registry
                .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_overrides_config() {
        assert_eq!(default_level(0, None), "warn");
        assert_eq!(default_level(0, Some("error")), "error");
        assert_eq!(default_level(1, Some("error")), "info");
        assert_eq!(default_level(3, None), "debug");
    }
}
