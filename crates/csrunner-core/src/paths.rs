//! Path resolution for the supervisor data directory.
//!
//! The canonical layout under the data root `D`:
//!
//! ```text
//! D/configurations/<config_id>.json
//! D/logs/<config_id>/<app_id>/current.log
//! D/logs/<config_id>/<app_id>/<YYYY-MM-DD-HH-MM-SS>.log
//! D/state/              (reserved)
//! D/server_config.json
//! ```
//!
//! No interactive I/O here; adapters decide how resolution failures are
//! reported to the user.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Environment override for the data root, mirroring the `--data-dir` flag.
pub const DATA_DIR_ENV: &str = "CSRUNNER_DATA_DIR";

/// Directory name under `$HOME` used when nothing is overridden.
const DEFAULT_DIR_NAME: &str = ".clientserverrunner";

/// Errors from path resolution and directory preparation.
#[derive(Debug, Error)]
pub enum PathError {
    /// Could not determine the user's home directory.
    #[error("Cannot determine home directory")]
    NoHomeDir,

    /// A path was expected to be a directory but was not.
    #[error("{0} exists but is not a directory")]
    NotADirectory(PathBuf),

    /// Failed to create a directory.
    #[error("Failed to create directory {path}: {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    /// A directory is not writable.
    #[error("Directory {path} is not writable: {reason}")]
    NotWritable { path: PathBuf, reason: String },
}

/// Resolve the data root: explicit override, then `$CSRUNNER_DATA_DIR`,
/// then `$HOME/.clientserverrunner`.
pub fn resolve_data_root(override_path: Option<&Path>) -> Result<PathBuf, PathError> {
    if let Some(path) = override_path {
        return Ok(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var(DATA_DIR_ENV) {
        if !env_path.trim().is_empty() {
            return Ok(PathBuf::from(env_path));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DIR_NAME))
        .ok_or(PathError::NoHomeDir)
}

/// Resolved data directory layout.
#[derive(Debug, Clone)]
pub struct DataDirs {
    root: PathBuf,
}

impl DataDirs {
    /// Wrap an already-resolved root without touching the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve and prepare the full layout, creating missing directories and
    /// verifying the root is writable.
    pub fn prepare(override_path: Option<&Path>) -> Result<Self, PathError> {
        let dirs = Self::new(resolve_data_root(override_path)?);
        for dir in [
            dirs.root.clone(),
            dirs.configurations_dir(),
            dirs.logs_dir(),
            dirs.state_dir(),
        ] {
            ensure_directory(&dir)?;
        }
        verify_writable(&dirs.root)?;
        Ok(dirs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn configurations_dir(&self) -> PathBuf {
        self.root.join("configurations")
    }

    pub fn configuration_path(&self, config_id: &str) -> PathBuf {
        self.configurations_dir().join(format!("{config_id}.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn config_logs_dir(&self, config_id: &str) -> PathBuf {
        self.logs_dir().join(config_id)
    }

    pub fn app_logs_dir(&self, config_id: &str, app_id: &str) -> PathBuf {
        self.config_logs_dir(config_id).join(app_id)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn server_config_path(&self) -> PathBuf {
        self.root.join("server_config.json")
    }
}

/// Create `path` (and parents) if missing; reject non-directories.
pub fn ensure_directory(path: &Path) -> Result<(), PathError> {
    if path.exists() {
        if path.is_dir() {
            return Ok(());
        }
        return Err(PathError::NotADirectory(path.to_path_buf()));
    }
    fs::create_dir_all(path).map_err(|e| PathError::CreateFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Verify `path` is writable by creating and removing a probe file.
pub fn verify_writable(path: &Path) -> Result<(), PathError> {
    let probe = path.join(".write_probe");
    match fs::write(&probe, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => Err(PathError::NotWritable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn prepare_creates_layout() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        let dirs = DataDirs::prepare(Some(&root)).unwrap();

        assert!(dirs.configurations_dir().is_dir());
        assert!(dirs.logs_dir().is_dir());
        assert!(dirs.state_dir().is_dir());
        assert_eq!(
            dirs.configuration_path("web"),
            root.join("configurations/web.json")
        );
        assert_eq!(
            dirs.app_logs_dir("web", "api"),
            root.join("logs/web/api")
        );
    }

    #[test]
    fn explicit_override_wins() {
        let temp = TempDir::new().unwrap();
        let resolved = resolve_data_root(Some(temp.path())).unwrap();
        assert_eq!(resolved, temp.path());
    }

    #[test]
    fn ensure_directory_rejects_files() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            ensure_directory(&file),
            Err(PathError::NotADirectory(_))
        ));
    }
}
