//! Configuration document types.
//!
//! These are the persisted JSON documents under `configurations/<id>.json`.
//! All validation that can be done without runtime knowledge (duplicate app
//! ids, unknown dependencies, cycles) lives here; working-directory existence
//! is checked at start time by the process manager.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::graph;
use crate::error::SupervisorError;

const fn default_health_interval_secs() -> u64 {
    2
}

const fn default_health_timeout_secs() -> u64 {
    5
}

/// Kind of health probe an application declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    /// GET a URL; 2xx/3xx is healthy.
    Http,
    /// Open a TCP connection to loopback.
    Tcp,
    /// Process is alive and not a zombie.
    Process,
}

/// Health probe declaration for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub kind: HealthCheckKind,
    /// Target URL, required for `http` probes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Target port for `tcp` probes. May be omitted when the application has
    /// an allocated port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
}

impl HealthCheckSpec {
    /// An HTTP probe against `url` with default cadence.
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            kind: HealthCheckKind::Http,
            url: Some(url.into()),
            port: None,
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
        }
    }

    /// A TCP probe; `port = None` uses the application's allocated port.
    pub fn tcp(port: Option<u16>) -> Self {
        Self {
            kind: HealthCheckKind::Tcp,
            url: None,
            port,
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
        }
    }

    /// A bare process-liveness probe.
    pub fn process() -> Self {
        Self {
            kind: HealthCheckKind::Process,
            url: None,
            port: None,
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
        }
    }
}

/// One managed application within a configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    /// Identifier, unique within the configuration.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Handler tag: `python`, `npm`, `scala`, or a registered extension.
    pub app_type: String,
    /// Absolute working directory; must exist when the app is started.
    pub working_dir: PathBuf,
    /// Start command, run through the handler's `prepare_command`.
    pub command: String,
    /// Extra environment entries layered over the OS environment.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Optional build step run synchronously before spawn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default)]
    pub auto_restart: bool,
    /// Seconds allowed to reach `running`; the server-wide default applies
    /// when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_timeout_secs: Option<u64>,
    /// Sibling application ids that must be running first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Fixed port when positive; 0 or absent with `port_env_var` set means
    /// "allocate dynamically".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Environment variable the (fixed or allocated) port is exported as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_env_var: Option<String>,
}

impl ApplicationSpec {
    /// Minimal spec used as a starting point in tests and builders.
    pub fn new(
        id: impl Into<String>,
        app_type: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        command: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            app_type: app_type.into(),
            working_dir: working_dir.into(),
            command: command.into(),
            env: HashMap::new(),
            build_command: None,
            health_check: None,
            auto_restart: false,
            startup_timeout_secs: None,
            depends_on: Vec::new(),
            port: None,
            port_env_var: None,
        }
    }

    /// True when the spec asks for a dynamically allocated port.
    pub fn wants_dynamic_port(&self) -> bool {
        matches!(self.port, None | Some(0)) && self.port_env_var.is_some()
    }

    /// True when the spec declares a fixed positive port.
    pub fn fixed_port(&self) -> Option<u16> {
        match self.port {
            Some(p) if p > 0 => Some(p),
            _ => None,
        }
    }
}

/// A named group of application specs managed as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub applications: Vec<ApplicationSpec>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Configuration {
    /// Look up an application spec by id.
    pub fn application(&self, app_id: &str) -> Option<&ApplicationSpec> {
        self.applications.iter().find(|a| a.id == app_id)
    }

    /// Ids of all applications, in declaration order.
    pub fn app_ids(&self) -> Vec<String> {
        self.applications.iter().map(|a| a.id.clone()).collect()
    }

    /// Validate the document: non-empty name, unique non-empty app ids,
    /// known dependency ids, and an acyclic dependency graph.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::config_invalid("name must not be empty"));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for app in &self.applications {
            if app.id.trim().is_empty() {
                return Err(SupervisorError::config_invalid(
                    "application id must not be empty",
                ));
            }
            if !seen.insert(app.id.as_str()) {
                return Err(SupervisorError::config_invalid(format!(
                    "duplicate application id: {}",
                    app.id
                )));
            }
            if !app.working_dir.is_absolute() {
                return Err(SupervisorError::config_invalid(format!(
                    "application {}: working_dir must be absolute",
                    app.id
                )));
            }
            if app.command.trim().is_empty() {
                return Err(SupervisorError::config_invalid(format!(
                    "application {}: command must not be empty",
                    app.id
                )));
            }
        }

        for app in &self.applications {
            for dep in &app.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(SupervisorError::config_invalid(format!(
                        "application {} depends on unknown application {}",
                        app.id, dep
                    )));
                }
            }
        }

        let deps: HashMap<String, Vec<String>> = self
            .applications
            .iter()
            .map(|a| (a.id.clone(), a.depends_on.clone()))
            .collect();
        let ids = self.app_ids();
        if let Err(cycle) = graph::topo_sort(&ids, &deps) {
            return Err(SupervisorError::dependency_cycle(cycle));
        }

        Ok(())
    }
}

/// Compact listing entry for `list_configurations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub has_running: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(apps: Vec<ApplicationSpec>) -> Configuration {
        let now = Utc::now();
        Configuration {
            id: "test".to_string(),
            name: "Test".to_string(),
            description: None,
            applications: apps,
            created_at: now,
            updated_at: now,
        }
    }

    fn app(id: &str, deps: &[&str]) -> ApplicationSpec {
        let mut spec = ApplicationSpec::new(id, "python", "/tmp", "python app.py");
        spec.depends_on = deps.iter().map(ToString::to_string).collect();
        spec
    }

    #[test]
    fn validate_accepts_linear_dependencies() {
        let cfg = config_with(vec![app("a", &[]), app("b", &["a"]), app("c", &["b"])]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let cfg = config_with(vec![app("a", &[]), app("a", &[])]);
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let cfg = config_with(vec![app("a", &["ghost"])]);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown application"));
    }

    #[test]
    fn validate_rejects_cycle() {
        let cfg = config_with(vec![app("a", &["c"]), app("b", &["a"]), app("c", &["b"])]);
        let err = cfg.validate().unwrap_err();
        match err {
            SupervisorError::ConfigInvalid { cycle, .. } => {
                let cycle = cycle.expect("cycle members");
                assert_eq!(cycle.len(), 3);
            }
            other => panic!("expected ConfigInvalid, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_relative_working_dir() {
        let mut spec = ApplicationSpec::new("a", "python", "relative/dir", "python app.py");
        spec.depends_on = vec![];
        let cfg = config_with(vec![spec]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dynamic_port_requires_env_var() {
        let mut spec = ApplicationSpec::new("a", "python", "/tmp", "python app.py");
        assert!(!spec.wants_dynamic_port());
        spec.port_env_var = Some("PORT".to_string());
        assert!(spec.wants_dynamic_port());
        spec.port = Some(8080);
        assert!(!spec.wants_dynamic_port());
        assert_eq!(spec.fixed_port(), Some(8080));
    }

    #[test]
    fn spec_roundtrips_with_defaults() {
        let json = r#"{
            "id": "web",
            "name": "Web",
            "app_type": "npm",
            "working_dir": "/srv/web",
            "command": "npm run dev"
        }"#;
        let spec: ApplicationSpec = serde_json::from_str(json).unwrap();
        assert!(spec.startup_timeout_secs.is_none());
        assert!(!spec.auto_restart);
        assert!(spec.depends_on.is_empty());
    }
}
