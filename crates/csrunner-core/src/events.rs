//! Application lifecycle events.
//!
//! The process manager emits one event per state transition on a broadcast
//! channel. Consumers (tests, the control surface's bookkeeping) treat the
//! stream as the source of truth for lifecycle ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::AppState;

/// One application state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppEvent {
    pub config_id: String,
    pub app_id: String,
    pub state: AppState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub at: DateTime<Utc>,
}

impl AppEvent {
    /// Record a transition happening now.
    pub fn now(
        config_id: impl Into<String>,
        app_id: impl Into<String>,
        state: AppState,
        port: Option<u16>,
    ) -> Self {
        Self {
            config_id: config_id.into(),
            app_id: app_id.into(),
            state,
            port,
            at: Utc::now(),
        }
    }
}
