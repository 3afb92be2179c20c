//! Core domain types and persistence for the csrunner supervisor.
//!
//! This crate is infrastructure-free: it defines the configuration document
//! model, the application state machine types, the error taxonomy surfaced on
//! the control surface, path resolution for the data directory, and the
//! durable configuration store. Process execution lives in
//! `csrunner-runtime`; wiring lives in `csrunner-cli`.

pub mod domain;
pub mod error;
pub mod events;
pub mod paths;
pub mod settings;
pub mod store;

// Re-export the document model
pub use domain::{
    AppState, ApplicationSpec, ApplicationStatus, Configuration, ConfigurationSummary,
    HealthCheckKind, HealthCheckSpec, HealthVerdict,
};

// Re-export graph utilities used by both validation and orchestration
pub use domain::graph::{expand_with_dependencies, expand_with_dependents, topo_sort};

// Re-export the error taxonomy
pub use error::{StartupFailure, SupervisorError};

// Re-export lifecycle events
pub use events::AppEvent;

// Re-export persistence
pub use paths::{DataDirs, PathError};
pub use settings::ServerSettings;
pub use store::{ConfigStore, ConfigurationUpdate, NewConfiguration};
