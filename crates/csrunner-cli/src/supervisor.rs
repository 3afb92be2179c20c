//! The supervisor singleton: configuration store plus process manager,
//! with the runtime gating (`Busy`, force-stop on delete) that neither
//! component can decide alone.

use std::sync::Arc;

use csrunner_core::{
    ConfigStore, Configuration, ConfigurationSummary, ConfigurationUpdate, DataDirs,
    NewConfiguration, ServerSettings, SupervisorError,
};
use csrunner_runtime::{
    CommandResult, GroupResult, HandlerRegistry, LogEntry, ProcessManager, RunInfo, SearchMatch,
};
use tracing::info;

/// Everything the control surface dispatches into.
pub struct Supervisor {
    store: ConfigStore,
    manager: Arc<ProcessManager>,
}

impl Supervisor {
    /// Wire the store and manager over a prepared data directory.
    pub fn new(dirs: DataDirs) -> Result<Self, SupervisorError> {
        let settings = ServerSettings::load(&dirs.server_config_path())
            .map_err(|e| SupervisorError::config_invalid(format!("server_config.json: {e}")))?;
        let registry = Arc::new(HandlerRegistry::with_builtins());
        let manager = Arc::new(ProcessManager::new(dirs.clone(), settings, registry));
        Ok(Self {
            store: ConfigStore::new(dirs),
            manager,
        })
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    // ---- configuration verbs ----

    pub async fn list_configurations(&self) -> Result<Vec<ConfigurationSummary>, SupervisorError> {
        let mut summaries = Vec::new();
        for config in self.store.list()? {
            summaries.push(ConfigurationSummary {
                has_running: self.manager.has_running(&config.id).await,
                id: config.id,
                name: config.name,
                description: config.description,
                created_at: config.created_at,
                updated_at: config.updated_at,
            });
        }
        Ok(summaries)
    }

    pub async fn create_configuration(
        &self,
        new: NewConfiguration,
    ) -> Result<Configuration, SupervisorError> {
        self.store.create(new).await
    }

    pub fn get_configuration(&self, config_id: &str) -> Result<Configuration, SupervisorError> {
        self.store.get(config_id)
    }

    /// Updates require every application of the configuration stopped.
    pub async fn update_configuration(
        &self,
        config_id: &str,
        update: ConfigurationUpdate,
    ) -> Result<Configuration, SupervisorError> {
        self.store.get(config_id)?;
        if self.manager.has_running(config_id).await {
            return Err(SupervisorError::Busy(config_id.to_string()));
        }
        self.store.update(config_id, update).await
    }

    /// Delete refuses while running unless `force`, which group-stops first.
    pub async fn delete_configuration(
        &self,
        config_id: &str,
        force: bool,
    ) -> Result<(), SupervisorError> {
        let config = self.store.get(config_id)?;
        if self.manager.has_running(config_id).await {
            if !force {
                return Err(SupervisorError::Busy(config_id.to_string()));
            }
            self.manager.stop(&config, None, true).await?;
        }
        self.store.delete(config_id).await?;
        self.manager.remove_config(config_id);
        Ok(())
    }

    // ---- lifecycle verbs ----

    pub async fn start_configuration(
        &self,
        config_id: &str,
        app_ids: Option<&[String]>,
    ) -> Result<GroupResult, SupervisorError> {
        let config = self.store.get(config_id)?;
        self.manager.start(&config, app_ids).await
    }

    pub async fn stop_configuration(
        &self,
        config_id: &str,
        app_ids: Option<&[String]>,
        graceful: bool,
    ) -> Result<GroupResult, SupervisorError> {
        let config = self.store.get(config_id)?;
        self.manager.stop(&config, app_ids, graceful).await
    }

    pub async fn restart_configuration(
        &self,
        config_id: &str,
        app_ids: Option<&[String]>,
    ) -> Result<GroupResult, SupervisorError> {
        let config = self.store.get(config_id)?;
        self.manager.restart(&config, app_ids).await
    }

    pub async fn get_status(
        &self,
        config_id: &str,
        app_ids: Option<&[String]>,
    ) -> Result<std::collections::BTreeMap<String, csrunner_core::ApplicationStatus>, SupervisorError>
    {
        let config = self.store.get(config_id)?;
        self.manager.status(&config, app_ids).await
    }

    // ---- log verbs ----

    pub async fn get_logs(
        &self,
        config_id: &str,
        app_id: &str,
        lines: usize,
        run_id: Option<&str>,
    ) -> Result<Vec<LogEntry>, SupervisorError> {
        self.require_app(config_id, app_id)?;
        self.manager
            .pipeline(config_id, app_id)?
            .tail(lines, run_id)
            .await
    }

    pub async fn search_logs(
        &self,
        config_id: &str,
        app_id: &str,
        query: &str,
        max_results: usize,
        case_sensitive: bool,
    ) -> Result<Vec<SearchMatch>, SupervisorError> {
        self.require_app(config_id, app_id)?;
        self.manager
            .pipeline(config_id, app_id)?
            .search(query, max_results, case_sensitive)
            .await
    }

    pub fn list_log_runs(
        &self,
        config_id: &str,
        app_id: &str,
    ) -> Result<Vec<RunInfo>, SupervisorError> {
        self.require_app(config_id, app_id)?;
        Ok(self.manager.pipeline(config_id, app_id)?.list_runs())
    }

    // ---- handler verbs ----

    pub async fn run_command(
        &self,
        config_id: &str,
        app_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<CommandResult, SupervisorError> {
        let config = self.store.get(config_id)?;
        self.manager.run_command(&config, app_id, command, args).await
    }

    pub async fn trigger_reload(
        &self,
        config_id: &str,
        app_id: &str,
    ) -> Result<(bool, String), SupervisorError> {
        let config = self.store.get(config_id)?;
        self.manager.trigger_reload(&config, app_id).await
    }

    /// Drain every loaded configuration on shutdown.
    pub async fn shutdown(&self) {
        info!("Supervisor shutting down");
        let configs = self.store.list().unwrap_or_default();
        self.manager.shutdown(&configs).await;
    }

    fn require_app(&self, config_id: &str, app_id: &str) -> Result<(), SupervisorError> {
        let config = self.store.get(config_id)?;
        if config.application(app_id).is_none() {
            return Err(SupervisorError::NotFound(format!(
                "application {app_id} in configuration {config_id}"
            )));
        }
        Ok(())
    }
}
