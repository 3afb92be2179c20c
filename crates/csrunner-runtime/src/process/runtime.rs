//! Per-application runtime state.
//!
//! One `AppRuntime` per (configuration, application), guarded by its
//! handle's async mutex. Only the process manager mutates it. The `epoch`
//! counter invalidates background tasks (exit waiters, health loops,
//! pending restarts) from previous runs: every task captures the epoch it
//! was spawned under and bails out when the runtime has moved on.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use csrunner_core::{AppState, ApplicationStatus, HealthVerdict};
use tokio::sync::{Mutex, watch};

/// Exit code of a reaped child; `None` when it died to a signal.
pub(crate) type ExitNotice = Option<i32>;

/// Restart attempts allowed within any rolling hour.
pub(crate) const MAX_RESTARTS_PER_HOUR: usize = 10;

/// Backoff before auto-restart attempt `seq`: 1, 2, 4, 8, 16, then 30s.
pub(crate) fn backoff_delay(seq: u32) -> Duration {
    let secs = match seq {
        0..=4 => 1u64 << seq,
        _ => 30,
    };
    Duration::from_secs(secs)
}

/// Handle for one application: identity plus the locked runtime.
pub(crate) struct AppHandle {
    pub config_id: String,
    pub app_id: String,
    pub runtime: Mutex<AppRuntime>,
}

impl AppHandle {
    pub fn new(config_id: String, app_id: String) -> Self {
        Self {
            config_id,
            app_id,
            runtime: Mutex::new(AppRuntime::default()),
        }
    }
}

/// Mutable runtime of one application. Never persisted.
#[derive(Default)]
pub(crate) struct AppRuntime {
    pub state: AppState,
    pub pid: Option<u32>,
    /// Port handed out by the allocator; `None` for fixed-port apps.
    pub allocated_port: Option<u16>,
    /// Fixed port currently held in the reservation set.
    pub reserved_fixed_port: Option<u16>,
    pub resolved_env: HashMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub health: HealthVerdict,
    /// Archive name the current run's log will be filed under.
    pub run_id: Option<String>,
    /// Signalled once by the exit waiter when the child is reaped.
    pub exit_rx: Option<watch::Receiver<Option<ExitNotice>>>,
    /// Bumped on every manual start/stop; stale background tasks bail out.
    pub epoch: u64,
    /// Auto-restart instants within the rolling window.
    pub restart_attempts: VecDeque<DateTime<Utc>>,
    /// Consecutive auto-restarts, indexes the backoff ladder.
    pub restart_seq: u32,
}

impl AppRuntime {
    /// The port the application is reachable on, however it got it.
    pub fn current_port(&self) -> Option<u16> {
        self.allocated_port.or(self.reserved_fixed_port)
    }

    /// Prune the rolling window and report whether another auto-restart is
    /// allowed right now.
    pub fn restart_budget_left(&mut self, now: DateTime<Utc>) -> bool {
        let cutoff = now - chrono::Duration::hours(1);
        while self
            .restart_attempts
            .front()
            .is_some_and(|at| *at < cutoff)
        {
            self.restart_attempts.pop_front();
        }
        self.restart_attempts.len() < MAX_RESTARTS_PER_HOUR
    }

    /// Snapshot for `get_status`.
    pub fn status(&self) -> ApplicationStatus {
        ApplicationStatus {
            state: self.state,
            pid: self.pid,
            exit_code: self.exit_code,
            started_at: self.started_at,
            error_message: self.error_message.clone(),
            health: self.health,
            allocated_port: self.allocated_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_caps_at_thirty() {
        let secs: Vec<u64> = (0..8).map(|s| backoff_delay(s).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn restart_budget_rolls_over_an_hour() {
        let mut rt = AppRuntime::default();
        let now = Utc::now();
        for i in 0..MAX_RESTARTS_PER_HOUR {
            let at = now - chrono::Duration::minutes(59 - i as i64);
            rt.restart_attempts.push_back(at);
        }
        assert!(!rt.restart_budget_left(now));

        // An hour later the oldest attempts have aged out
        let later = now + chrono::Duration::minutes(2);
        assert!(rt.restart_budget_left(later));
    }

    #[test]
    fn fresh_runtime_is_stopped() {
        let rt = AppRuntime::default();
        assert_eq!(rt.state, AppState::Stopped);
        assert!(rt.current_port().is_none());
        let status = rt.status();
        assert_eq!(status.state, AppState::Stopped);
        assert_eq!(status.health, HealthVerdict::Unknown);
    }
}
