//! Server settings document (`server_config.json`).
//!
//! All fields are optional so a hand-edited partial document keeps working;
//! absent fields fall back to the defaults below.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Archived log runs kept per application.
pub const DEFAULT_LOG_RETENTION: usize = 10;

/// Grace period between SIGTERM and SIGKILL on stop.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Startup timeout applied when a spec declares none.
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Server-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Archived runs kept per application (newest kept).
    pub log_retention: Option<usize>,
    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    pub stop_timeout_secs: Option<u64>,
    /// Default startup timeout applied when a spec declares none.
    pub default_startup_timeout_secs: Option<u64>,
}

impl ServerSettings {
    /// Load from `path`, falling back to defaults when the file is absent.
    /// A malformed document is an error; silently ignoring it would make a
    /// typo in the file invisible.
    pub fn load(path: &Path) -> Result<Self, serde_json::Error> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn log_retention(&self) -> usize {
        self.log_retention.unwrap_or(DEFAULT_LOG_RETENTION)
    }

    pub fn stop_timeout_secs(&self) -> u64 {
        self.stop_timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS)
    }

    pub fn default_startup_timeout_secs(&self) -> u64 {
        self.default_startup_timeout_secs
            .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = ServerSettings::load(&temp.path().join("server_config.json")).unwrap();
        assert_eq!(settings.log_retention(), DEFAULT_LOG_RETENTION);
        assert_eq!(settings.stop_timeout_secs(), DEFAULT_STOP_TIMEOUT_SECS);
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server_config.json");
        std::fs::write(&path, r#"{"log_retention": 3}"#).unwrap();
        let settings = ServerSettings::load(&path).unwrap();
        assert_eq!(settings.log_retention(), 3);
        assert_eq!(settings.stop_timeout_secs(), DEFAULT_STOP_TIMEOUT_SECS);
        assert_eq!(
            settings.default_startup_timeout_secs(),
            DEFAULT_STARTUP_TIMEOUT_SECS
        );
    }

    #[test]
    fn declared_startup_timeout_wins() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server_config.json");
        std::fs::write(&path, r#"{"default_startup_timeout_secs": 90}"#).unwrap();
        let settings = ServerSettings::load(&path).unwrap();
        assert_eq!(settings.default_startup_timeout_secs(), 90);
    }

    #[test]
    fn malformed_document_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("server_config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(ServerSettings::load(&path).is_err());
    }
}
