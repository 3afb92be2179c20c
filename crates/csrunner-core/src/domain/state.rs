//! Application lifecycle state machine types.
//!
//! The state value itself is a plain tagged enum; all transitions are driven
//! by the process manager in `csrunner-runtime` under a per-app lock. Nothing
//! else mutates runtime state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one managed application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Not running; the initial and final state.
    #[default]
    Stopped,
    /// Spawned (or about to spawn) but not yet confirmed healthy.
    Starting,
    /// Confirmed healthy and under supervision.
    Running,
    /// Exited or never became healthy; `exit_code`/`error_message` say why.
    Failed,
    /// Stop requested, waiting for the child to go away.
    Stopping,
}

impl AppState {
    /// States in which a child process handle exists.
    pub fn has_child(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Latest health probe result for an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    /// No probe has run yet, or the probe had nothing to check.
    #[default]
    Unknown,
}

/// Snapshot of one application's runtime, as returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub state: AppState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub health: HealthVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_port: Option<u16>,
}

impl ApplicationStatus {
    /// Status of an application that has never been started.
    pub fn stopped() -> Self {
        Self {
            state: AppState::Stopped,
            pid: None,
            exit_code: None,
            started_at: None,
            error_message: None,
            health: HealthVerdict::Unknown,
            allocated_port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AppState::Running).unwrap(), "\"running\"");
        assert_eq!(serde_json::to_string(&AppState::Stopped).unwrap(), "\"stopped\"");
    }

    #[test]
    fn child_handle_states() {
        assert!(AppState::Starting.has_child());
        assert!(AppState::Running.has_child());
        assert!(AppState::Stopping.has_child());
        assert!(!AppState::Stopped.has_child());
        assert!(!AppState::Failed.has_child());
    }
}
