//! Directory layout and file locations for the runner.

use std::path::{Path, PathBuf};

use crate::config::FileManagerConfig;

#[derive(Debug, thiserror::Error)]
pub enum FileManagerError {
    #[error("job id {0:?} cannot contain path separators")]
    PathSeparator(String),
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Owns the runner's directory structure: the runner tree (cache, config,
/// logs) and the simulation directory holding per-job case directories.
#[derive(Debug, Clone)]
pub struct FileManager {
    runner_dir: PathBuf,
    cache_dir: PathBuf,
    config_dir: PathBuf,
    log_dir: PathBuf,
    simulation_dir: PathBuf,
}

impl FileManager {
    /// Resolve the directory layout from configuration. No I/O happens
    /// here; call [`FileManager::init_directories`] to create the tree.
    pub fn new(config: &FileManagerConfig) -> Self {
        let runner_dir = config.working_directory.clone();
        let simulation_dir = if config.simulation_directory.is_absolute() {
            config.simulation_directory.clone()
        } else {
            runner_dir.join(&config.simulation_directory)
        };

        Self {
            cache_dir: runner_dir.join("cache"),
            config_dir: runner_dir.join("config"),
            log_dir: runner_dir.join("logs"),
            runner_dir,
            simulation_dir,
        }
    }

    /// Create the full directory tree. Existing directories are fine.
    pub fn init_directories(&self) -> Result<(), FileManagerError> {
        for dir in [
            &self.runner_dir,
            &self.cache_dir,
            &self.config_dir,
            &self.log_dir,
            &self.simulation_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|source| FileManagerError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Delete the runner tree. The simulation directory is only removed when
    /// `delete_simulations` is set, or when it is already empty.
    pub fn remove_directories(&self, delete_simulations: bool) -> std::io::Result<()> {
        if self.runner_dir.exists() {
            std::fs::remove_dir_all(&self.runner_dir)?;
        }

        if self.simulation_dir.exists() {
            let empty = self.simulation_dir.read_dir()?.next().is_none();
            if delete_simulations || empty {
                std::fs::remove_dir_all(&self.simulation_dir)?;
            }
        }
        Ok(())
    }

    /// Create and return the case directory for a job.
    ///
    /// Ids containing path separators are rejected before any filesystem
    /// access so a malicious id cannot escape the simulation directory.
    pub fn request_simulation_directory(&self, job_id: &str) -> Result<PathBuf, FileManagerError> {
        if job_id.contains('/') || job_id.contains('\\') {
            return Err(FileManagerError::PathSeparator(job_id.to_string()));
        }

        let case_dir = self.simulation_dir.join(job_id);
        std::fs::create_dir_all(&case_dir).map_err(|source| FileManagerError::CreateDir {
            path: case_dir.clone(),
            source,
        })?;
        Ok(case_dir)
    }

    pub fn runner_dir(&self) -> &Path {
        &self.runner_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn simulation_dir(&self) -> &Path {
        &self.simulation_dir
    }
}

/// Location of the pointer file recording the default config path used by
/// `run` when `-c` is not given.
pub fn default_config_pointer() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join(crate::APP_NAME).join("default_config"))
}

/// Read the default config path, if one has been recorded.
pub fn read_default_config_path() -> Option<PathBuf> {
    let pointer = default_config_pointer().ok()?;
    let raw = std::fs::read_to_string(pointer).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

/// Record `path` as the default config for future `run` invocations.
pub fn write_default_config_path(path: &Path) -> anyhow::Result<()> {
    let pointer = default_config_pointer()?;
    let dir = pointer
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid pointer path: {}", pointer.display()))?;
    std::fs::create_dir_all(dir)?;
    std::fs::write(&pointer, format!("{}\n", path.display()))?;
    Ok(())
}

/// Remove the default-config pointer file, if present.
pub fn delete_default_config_path() -> anyhow::Result<()> {
    let pointer = default_config_pointer()?;
    if pointer.exists() {
        std::fs::remove_file(&pointer)?;
    }
    Ok(())
}

pub(crate) fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub(crate) fn xdg_data_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_DATA_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".local").join("share"))
}

#[cfg(test)]
#[path = "files_tests.rs"]
mod tests;
