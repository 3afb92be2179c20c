//! Durable configuration store.
//!
//! One JSON document per configuration under `configurations/<id>.json`.
//! Writes go through a temp sibling with fsync and an atomic rename, so a
//! reader observes either the previous or the new document, never a
//! truncated one. The store is a single writer per instance (one async
//! mutex); runtime gating (`Busy`, force-stop on delete) is the caller's
//! responsibility since only the process manager knows what is running.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{ApplicationSpec, Configuration};
use crate::error::SupervisorError;
use crate::paths::DataDirs;

/// Payload for `create_configuration`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewConfiguration {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub applications: Vec<ApplicationSpec>,
}

/// Partial update for `update_configuration`. Absent fields keep their
/// current values.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ConfigurationUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub applications: Option<Vec<ApplicationSpec>>,
}

/// CRUD over configuration documents.
pub struct ConfigStore {
    dirs: DataDirs,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(dirs: DataDirs) -> Self {
        Self {
            dirs,
            write_lock: Mutex::new(()),
        }
    }

    /// Validate, assign an id, persist, and return the new document.
    pub async fn create(&self, new: NewConfiguration) -> Result<Configuration, SupervisorError> {
        let _guard = self.write_lock.lock().await;

        let now = Utc::now();
        let id = self.assign_id(&new.name);
        let config = Configuration {
            id,
            name: new.name,
            description: new.description,
            applications: new.applications,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;

        self.write_document(&config)?;
        info!(config_id = %config.id, "Created configuration");
        Ok(config)
    }

    /// Read one document.
    pub fn get(&self, config_id: &str) -> Result<Configuration, SupervisorError> {
        let path = self.dirs.configuration_path(config_id);
        let contents = fs::read_to_string(&path)
            .map_err(|_| SupervisorError::NotFound(format!("configuration {config_id}")))?;
        serde_json::from_str(&contents).map_err(|e| {
            SupervisorError::internal(format!("corrupt configuration document {config_id}: {e}"))
        })
    }

    /// Read all documents, sorted by id. Unparseable files are skipped with
    /// a log line rather than failing the whole listing.
    pub fn list(&self) -> Result<Vec<Configuration>, SupervisorError> {
        let dir = self.dirs.configurations_dir();
        let entries = fs::read_dir(&dir)
            .map_err(|e| SupervisorError::internal(format!("cannot read {}: {e}", dir.display())))?;

        let mut configs = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|c| serde_json::from_str::<Configuration>(&c).ok())
            {
                Some(config) => configs.push(config),
                None => {
                    debug!(path = %path.display(), "Skipping unreadable configuration document");
                }
            }
        }
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }

    /// Merge a partial update into an existing document and persist it.
    pub async fn update(
        &self,
        config_id: &str,
        update: ConfigurationUpdate,
    ) -> Result<Configuration, SupervisorError> {
        let _guard = self.write_lock.lock().await;

        let mut config = self.get(config_id)?;
        if let Some(name) = update.name {
            config.name = name;
        }
        if let Some(description) = update.description {
            config.description = Some(description);
        }
        if let Some(applications) = update.applications {
            config.applications = applications;
        }
        config.updated_at = Utc::now();
        config.validate()?;

        self.write_document(&config)?;
        info!(config_id = %config_id, "Updated configuration");
        Ok(config)
    }

    /// Remove the document and the configuration's log tree.
    pub async fn delete(&self, config_id: &str) -> Result<(), SupervisorError> {
        let _guard = self.write_lock.lock().await;

        let path = self.dirs.configuration_path(config_id);
        if !path.exists() {
            return Err(SupervisorError::NotFound(format!(
                "configuration {config_id}"
            )));
        }
        fs::remove_file(&path)
            .map_err(|e| SupervisorError::internal(format!("cannot delete {config_id}: {e}")))?;

        let logs = self.dirs.config_logs_dir(config_id);
        if logs.exists() {
            if let Err(e) = fs::remove_dir_all(&logs) {
                debug!(config_id = %config_id, error = %e, "Failed to remove log directory");
            }
        }

        info!(config_id = %config_id, "Deleted configuration");
        Ok(())
    }

    /// Derive a unique slug id from the display name: lowercase, runs of
    /// non-alphanumerics collapsed to `-`, numeric suffix on collision.
    /// A name with no usable characters falls back to a UUID.
    fn assign_id(&self, name: &str) -> String {
        let base = slugify(name);
        let base = if base.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            base
        };

        if !self.dirs.configuration_path(&base).exists() {
            return base;
        }
        for n in 2.. {
            let candidate = format!("{base}-{n}");
            if !self.dirs.configuration_path(&candidate).exists() {
                return candidate;
            }
        }
        unreachable!()
    }

    /// Temp sibling, fsync, rename.
    fn write_document(&self, config: &Configuration) -> Result<(), SupervisorError> {
        let target = self.dirs.configuration_path(&config.id);
        let tmp: PathBuf = target.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(config)
            .map_err(|e| SupervisorError::internal(format!("serialize {}: {e}", config.id)))?;

        let io_err =
            |e: std::io::Error| SupervisorError::internal(format!("write {}: {e}", config.id));

        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(&body).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&tmp, &target).map_err(io_err)?;
        Ok(())
    }
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true; // suppress a leading dash
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
