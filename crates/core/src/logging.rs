//! Logging setup: one session-stamped log file per start, an optional
//! stderr mirror in develop mode, and a retention sweep of old files.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Install the global tracing subscriber and return the path of the log
/// file this session writes to.
pub fn init_logging(log_dir: &Path, config: &LoggingConfig) -> anyhow::Result<PathBuf> {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H%M%S");
    let log_path = log_dir.join(format!("{}_{stamp}.log", crate::APP_NAME));
    let file = std::fs::File::create(&log_path)
        .with_context(|| format!("create log file {}", log_path.display()))?;

    let filter = config.level.filter();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::sync::Mutex::new(file))
        .with_filter(filter);
    let stderr_layer = config.develop.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))?;

    tracing::info!("logging to {}", log_path.display());
    if config.develop {
        tracing::info!("develop mode: mirroring logs to stderr");
    }

    match cleanup_old_logs(log_dir, config.retention_days) {
        Ok(0) => {}
        Ok(count) => tracing::info!(
            "removed {count} log file(s) older than {} days",
            config.retention_days
        ),
        Err(err) => tracing::error!("log retention sweep failed: {err:#}"),
    }

    Ok(log_path)
}

/// Delete log files older than `retention_days`. Returns how many were
/// removed.
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> std::io::Result<usize> {
    let age = Duration::from_secs(u64::from(retention_days) * 86_400);
    let Some(cutoff) = SystemTime::now().checked_sub(age) else {
        return Ok(0);
    };

    let prefix = format!("{}_", crate::APP_NAME);
    let mut removed = 0;
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&prefix) || !name.ends_with(".log") {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if modified < cutoff {
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
#[path = "logging_tests.rs"]
mod tests;
