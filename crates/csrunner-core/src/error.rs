//! The error taxonomy surfaced on the control surface.
//!
//! Expected per-application conditions (a child that exits, a probe that
//! never passes) do not travel as `Err` across component boundaries; they
//! land in the application's runtime state and the per-app group result.
//! These variants cover dispatch-level refusals and configuration problems.

use thiserror::Error;

/// Why an application failed to reach `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupFailure {
    /// The child exited before a healthy verdict.
    Exited,
    /// `startup_timeout` elapsed without a healthy verdict.
    Timeout,
    /// The probe reported the application unhealthy at spawn.
    Unhealthy,
}

impl std::fmt::Display for StartupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Exited => "exited",
            Self::Timeout => "timeout",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Errors returned to the control surface.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Unknown configuration or application id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Schema violation, unknown dependency, cycle, duplicate app id, or a
    /// bad working directory.
    #[error("invalid configuration: {reason}")]
    ConfigInvalid {
        reason: String,
        /// Members of the dependency cycle, when that is the violation.
        cycle: Option<Vec<String>>,
    },

    /// Mutation attempted while applications are not stopped.
    #[error("configuration {0} has applications that are not stopped")]
    Busy(String),

    /// A fixed port is held by a managed application, or the OS refused to
    /// bind during allocation.
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    /// `build_command` returned non-zero.
    #[error("build failed with exit code {exit_code}")]
    BuildFailed { exit_code: i32, tail: String },

    /// The application never reached `running`.
    #[error("startup failed: {reason}")]
    StartupFailed { reason: StartupFailure },

    /// `app_type` is not in the handler registry.
    #[error("no handler registered for app_type {app_type}")]
    HandlerMissing { app_type: String },

    /// Dispatch-level refusal of `run_command`. A recognised command that
    /// merely exits non-zero is a successful dispatch, not this.
    #[error("command failed with exit code {exit_code}")]
    CommandFailed { exit_code: i32 },

    /// A bug. Logged with a stable correlation id.
    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl SupervisorError {
    /// Stable wire identifier for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ConfigInvalid { .. } => "config_invalid",
            Self::Busy(_) => "busy",
            Self::PortUnavailable(_) => "port_unavailable",
            Self::BuildFailed { .. } => "build_failed",
            Self::StartupFailed { .. } => "startup_failed",
            Self::HandlerMissing { .. } => "handler_missing",
            Self::CommandFailed { .. } => "command_failed",
            Self::Internal { .. } => "internal",
        }
    }

    /// A `ConfigInvalid` with no cycle attached.
    pub fn config_invalid(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            reason: reason.into(),
            cycle: None,
        }
    }

    /// A `ConfigInvalid` carrying the dependency cycle members.
    pub fn dependency_cycle(cycle: Vec<String>) -> Self {
        Self::ConfigInvalid {
            reason: format!("dependency cycle: {}", cycle.join(" -> ")),
            cycle: Some(cycle),
        }
    }

    /// An `Internal` error with a fresh correlation id, logged at error
    /// level so the id can be grepped out of the logs.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(correlation_id = %correlation_id, "{message}");
        Self::Internal {
            correlation_id,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(SupervisorError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(SupervisorError::Busy("x".into()).kind(), "busy");
        assert_eq!(
            SupervisorError::dependency_cycle(vec!["a".into(), "b".into()]).kind(),
            "config_invalid"
        );
    }

    #[test]
    fn cycle_message_names_members() {
        let err = SupervisorError::dependency_cycle(vec!["a".into(), "b".into()]);
        assert!(err.to_string().contains("a -> b"));
    }

    #[test]
    fn internal_errors_get_distinct_ids() {
        let a = SupervisorError::internal("boom");
        let b = SupervisorError::internal("boom");
        let (SupervisorError::Internal { correlation_id: ca, .. },
             SupervisorError::Internal { correlation_id: cb, .. }) = (a, b)
        else {
            panic!("expected Internal");
        };
        assert_ne!(ca, cb);
    }
}
