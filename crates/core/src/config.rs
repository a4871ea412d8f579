//! YAML configuration model for the runner.
//!
//! The file has four top-level sections (`logging`, `file_manager`,
//! `server_proxy`, `job_manager`); unknown keys are rejected at load so a
//! typo cannot silently fall back to a default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Root configuration for the runner application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub file_manager: FileManagerConfig,
    pub server_proxy: ServerProxyConfig,
    #[serde(default)]
    pub job_manager: JobManagerConfig,
}

impl RunnerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RunnerConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration to `path` (atomic tmp-file rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        let tmp = path.with_extension("yaml.tmp");
        let write = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        std::fs::write(&tmp, yaml).map_err(write)?;
        std::fs::rename(&tmp, path).map_err(write)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server_proxy.validate()?;
        if self.job_manager.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "job_manager.max_concurrent_jobs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Minimum level written to the log file.
    #[serde(default)]
    pub level: LogLevel,
    /// Development mode adds a stderr writer next to the log file.
    #[serde(default)]
    pub develop: bool,
    /// Log files older than this many days are removed at startup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            develop: false,
            retention_days: default_retention_days(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Map to a `tracing` level filter. `CRITICAL` has no direct
    /// counterpart and collapses onto `ERROR`.
    pub fn filter(self) -> tracing_subscriber::filter::LevelFilter {
        use tracing_subscriber::filter::LevelFilter;
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

/// File management section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileManagerConfig {
    /// Root of the runner's own directory tree (cache, config, logs).
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,
    /// Where simulation case directories live. A relative path is resolved
    /// against `working_directory`.
    #[serde(default = "default_simulation_directory")]
    pub simulation_directory: PathBuf,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            working_directory: default_working_directory(),
            simulation_directory: default_simulation_directory(),
        }
    }
}

fn default_working_directory() -> PathBuf {
    crate::files::xdg_data_home()
        .map(|dir| dir.join(crate::APP_NAME))
        .unwrap_or_else(|_| PathBuf::from(format!(".{}", crate::APP_NAME)))
}

fn default_simulation_directory() -> PathBuf {
    PathBuf::from("simulations")
}

/// Server proxy section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerProxyConfig {
    /// Display name of this runner.
    #[serde(default = "default_runner_name")]
    pub name: String,
    /// Identity used on every interaction with the control plane.
    pub id: Uuid,
    /// Authentication token paired with `id`.
    pub token: Uuid,
    /// Base endpoint of the control plane API.
    pub api_url: Url,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Seconds between heartbeat status reports.
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

impl ServerProxyConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.scheme() != "https" {
            return Err(ConfigError::Invalid(format!(
                "server_proxy.api_url must use https, got {}",
                self.api_url.scheme()
            )));
        }
        if self.api_port == 0 {
            return Err(ConfigError::Invalid(
                "server_proxy.api_port must be in 1..=65535".into(),
            ));
        }
        if self.report_interval == 0 {
            return Err(ConfigError::Invalid(
                "server_proxy.report_interval must be at least 1 second".into(),
            ));
        }
        Ok(())
    }
}

fn default_runner_name() -> String {
    "unnamed_runner".to_string()
}

fn default_api_port() -> u16 {
    443
}

fn default_report_interval() -> u64 {
    600
}

/// Job manager section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobManagerConfig {
    /// Upper bound on concurrently running job workers.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Main loop iterations before the manager shuts itself down.
    #[serde(default = "default_max_main_loop_count")]
    pub max_main_loop_count: u64,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_main_loop_count: default_max_main_loop_count(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_max_main_loop_count() -> u64 {
    u64::MAX
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
