//! The orchestration core: dependency-ordered group start/stop, the
//! per-application state machine, and auto-restart supervision.
//!
//! Locking discipline: every state transition for an app happens under that
//! app's mutex, group operations visit apps in topological order, and no
//! lock is held across a spawn, a probe, or file I/O - the lock is released
//! first and re-acquired to commit, with the `epoch` counter detecting that
//! a concurrent operation got there in between.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use csrunner_core::{
    AppEvent, AppState, ApplicationSpec, ApplicationStatus, Configuration, DataDirs,
    HealthCheckSpec, HealthVerdict, ServerSettings, SupervisorError, expand_with_dependencies,
    expand_with_dependents, topo_sort,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::runtime::{AppHandle, AppRuntime, ExitNotice, backoff_delay};
use super::{shutdown, spawn};
use crate::handlers::{CommandResult, HandlerRegistry, run_shell};
use crate::health::{HealthProber, ProbeContext};
use crate::logs::{LogPipeline, StreamTag};
use crate::ports::PortAllocator;

/// Per-app entry in a group start/stop result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppOutcome {
    pub state: AppState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-app results of a group operation, keyed by app id.
pub type GroupResult = BTreeMap<String, AppOutcome>;

type AppKey = (String, String);

/// Owns every `ApplicationRuntime` and drives all state transitions.
pub struct ProcessManager {
    dirs: DataDirs,
    settings: ServerSettings,
    registry: Arc<HandlerRegistry>,
    prober: HealthProber,
    allocator: PortAllocator,
    apps: StdMutex<HashMap<AppKey, Arc<AppHandle>>>,
    pipelines: StdMutex<HashMap<AppKey, Arc<LogPipeline>>>,
    events: broadcast::Sender<AppEvent>,
}

impl ProcessManager {
    pub fn new(dirs: DataDirs, settings: ServerSettings, registry: Arc<HandlerRegistry>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            dirs,
            settings,
            registry,
            prober: HealthProber::new(),
            allocator: PortAllocator::new(),
            apps: StdMutex::new(HashMap::new()),
            pipelines: StdMutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    /// Start applications in dependency order. `app_ids = None` targets the
    /// whole configuration; a subset is extended by its transitive
    /// dependencies. A failing app aborts the rest of the group but leaves
    /// already-running apps alone.
    pub async fn start(
        self: &Arc<Self>,
        config: &Configuration,
        app_ids: Option<&[String]>,
    ) -> Result<GroupResult, SupervisorError> {
        let deps = dependency_map(config);
        let targets = self.resolve_targets(config, app_ids)?;
        let expanded = expand_with_dependencies(&targets, &deps)
            .map_err(|unknown| {
                SupervisorError::config_invalid(format!("unknown dependency id: {unknown}"))
            })?;
        let order = topo_sort(&expanded, &deps).map_err(SupervisorError::dependency_cycle)?;

        let mut results = GroupResult::new();
        let mut aborted = false;
        for app_id in &order {
            let Some(spec) = config.application(app_id) else {
                continue;
            };
            if aborted {
                results.insert(
                    app_id.clone(),
                    AppOutcome {
                        state: self.peek_state(&config.id, app_id).await,
                        error: Some("group start aborted".to_string()),
                    },
                );
                continue;
            }
            let outcome = self.start_one(config, spec, true).await;
            if outcome.error.is_some() {
                aborted = true;
            }
            results.insert(app_id.clone(), outcome);
        }
        Ok(results)
    }

    /// Stop applications in reverse dependency order. A targeted subset is
    /// extended by its transitive dependents: anyone depending on a stopped
    /// app goes down first.
    pub async fn stop(
        self: &Arc<Self>,
        config: &Configuration,
        app_ids: Option<&[String]>,
        graceful: bool,
    ) -> Result<GroupResult, SupervisorError> {
        let deps = dependency_map(config);
        let targets = self.resolve_targets(config, app_ids)?;
        let expanded = expand_with_dependents(&targets, &deps);
        let order = topo_sort(&expanded, &deps).map_err(SupervisorError::dependency_cycle)?;

        let mut results = GroupResult::new();
        for app_id in order.iter().rev() {
            let outcome = self.stop_one(&config.id, app_id, graceful).await;
            results.insert(app_id.clone(), outcome);
        }
        Ok(results)
    }

    /// Stop then start the targeted subset; run ids advance.
    pub async fn restart(
        self: &Arc<Self>,
        config: &Configuration,
        app_ids: Option<&[String]>,
    ) -> Result<GroupResult, SupervisorError> {
        self.stop(config, app_ids, true).await?;
        self.start(config, app_ids).await
    }

    /// Runtime snapshot per targeted application.
    pub async fn status(
        &self,
        config: &Configuration,
        app_ids: Option<&[String]>,
    ) -> Result<BTreeMap<String, ApplicationStatus>, SupervisorError> {
        let targets = self.resolve_targets(config, app_ids)?;
        let mut statuses = BTreeMap::new();
        for app_id in targets {
            let status = match self.lookup(&config.id, &app_id) {
                Some(handle) => handle.runtime.lock().await.status(),
                None => ApplicationStatus::stopped(),
            };
            statuses.insert(app_id, status);
        }
        Ok(statuses)
    }

    /// Whether any application of the configuration is not `stopped`.
    pub async fn has_running(&self, config_id: &str) -> bool {
        let handles: Vec<Arc<AppHandle>> = {
            let apps = self.apps.lock().unwrap();
            apps.iter()
                .filter(|((cfg, _), _)| cfg == config_id)
                .map(|(_, handle)| handle.clone())
                .collect()
        };
        for handle in handles {
            if handle.runtime.lock().await.state != AppState::Stopped {
                return true;
            }
        }
        false
    }

    /// The log pipeline for an application, created lazily so log queries
    /// work before the first spawn.
    pub fn pipeline(
        &self,
        config_id: &str,
        app_id: &str,
    ) -> Result<Arc<LogPipeline>, SupervisorError> {
        let key = (config_id.to_string(), app_id.to_string());
        let mut pipelines = self.pipelines.lock().unwrap();
        if let Some(pipeline) = pipelines.get(&key) {
            return Ok(pipeline.clone());
        }
        let pipeline = Arc::new(LogPipeline::new(
            self.dirs.app_logs_dir(config_id, app_id),
            self.settings.log_retention(),
        )?);
        pipelines.insert(key, pipeline.clone());
        Ok(pipeline)
    }

    /// Dispatch a custom command through the application's handler, with the
    /// resolved environment when the app has one.
    pub async fn run_command(
        &self,
        config: &Configuration,
        app_id: &str,
        command: &str,
        args: &[String],
    ) -> Result<CommandResult, SupervisorError> {
        let spec = self.spec_of(config, app_id)?;
        let handler = self.registry.get(&spec.app_type)?;
        let env = match self.lookup(&config.id, app_id) {
            Some(handle) => {
                let rt = handle.runtime.lock().await;
                if rt.resolved_env.is_empty() {
                    spawn::build_env(spec, spec.fixed_port(), &[])
                } else {
                    rt.resolved_env.clone()
                }
            }
            None => spawn::build_env(spec, spec.fixed_port(), &[]),
        };
        handler.run_custom_command(spec, command, args, &env).await
    }

    /// Ask the application's handler to nudge a reload.
    pub async fn trigger_reload(
        &self,
        config: &Configuration,
        app_id: &str,
    ) -> Result<(bool, String), SupervisorError> {
        let spec = self.spec_of(config, app_id)?;
        let handler = self.registry.get(&spec.app_type)?;
        Ok(handler.trigger_reload(spec).await)
    }

    /// Drain everything: graceful group-stops with a 5-second outer
    /// deadline, then SIGKILL for survivors.
    pub async fn shutdown(self: &Arc<Self>, configs: &[Configuration]) {
        info!("Draining process manager");
        let drain = async {
            for config in configs {
                if let Err(e) = self.stop(config, None, true).await {
                    warn!(config_id = %config.id, error = %e, "Drain stop failed");
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
            warn!("Graceful drain timed out, killing survivors");
            let handles: Vec<Arc<AppHandle>> =
                self.apps.lock().unwrap().values().cloned().collect();
            for handle in handles {
                let mut rt = handle.runtime.lock().await;
                rt.epoch += 1;
                if let Some(pid) = rt.pid.take() {
                    shutdown::kill_group(pid);
                }
                self.release_ports(&mut rt);
                rt.state = AppState::Stopped;
                rt.exit_code = None;
                rt.error_message = None;
            }
        }
    }

    /// Forget runtimes and pipelines of a deleted configuration. Callers
    /// stop the configuration first.
    pub fn remove_config(&self, config_id: &str) {
        self.apps
            .lock()
            .unwrap()
            .retain(|(cfg, _), _| cfg != config_id);
        self.pipelines
            .lock()
            .unwrap()
            .retain(|(cfg, _), _| cfg != config_id);
    }

    // ---- single-app lifecycle ----

    async fn start_one(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &ApplicationSpec,
        manual: bool,
    ) -> AppOutcome {
        let handle = self.handle(&config.id, &spec.id);

        // Claim the app: only stopped/failed apps are started
        let epoch = {
            let mut rt = handle.runtime.lock().await;
            if !matches!(rt.state, AppState::Stopped | AppState::Failed) {
                return AppOutcome {
                    state: rt.state,
                    error: None,
                };
            }
            rt.epoch += 1;
            rt.state = AppState::Starting;
            rt.pid = None;
            rt.exit_code = None;
            rt.error_message = None;
            rt.health = HealthVerdict::Unknown;
            rt.started_at = None;
            rt.exit_rx = None;
            if manual {
                rt.restart_attempts.clear();
                rt.restart_seq = 0;
            }
            rt.epoch
        };
        self.emit(&config.id, &spec.id, AppState::Starting, None);
        info!(config_id = %config.id, app_id = %spec.id, "Starting application");

        match self.launch(config, spec, &handle, epoch).await {
            Ok(state) => AppOutcome { state, error: None },
            Err(message) => {
                self.fail_app(&config.id, &spec.id, &handle, epoch, &message).await;
                AppOutcome {
                    state: AppState::Failed,
                    error: Some(message),
                }
            }
        }
    }

    /// Everything between `starting` and `running`. Returns the state the
    /// app ended up in, or an error message describing the failure; the
    /// caller commits the failure.
    async fn launch(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &ApplicationSpec,
        handle: &Arc<AppHandle>,
        epoch: u64,
    ) -> Result<AppState, String> {
        if !spec.working_dir.is_dir() {
            return Err(format!(
                "working directory {} does not exist",
                spec.working_dir.display()
            ));
        }

        // Ports: fixed ports are verified against the reservation set,
        // dynamic ports come from the allocator
        let mut port = None;
        if let Some(fixed) = spec.fixed_port() {
            self.allocator
                .reserve_fixed(fixed)
                .map_err(|e| e.to_string())?;
            let mut rt = handle.runtime.lock().await;
            if rt.epoch != epoch {
                self.allocator.release(fixed);
                return Err("superseded by a concurrent operation".to_string());
            }
            rt.reserved_fixed_port = Some(fixed);
            port = Some(fixed);
        } else if spec.wants_dynamic_port() {
            let allocated = self.allocator.allocate().map_err(|e| e.to_string())?;
            let mut rt = handle.runtime.lock().await;
            if rt.epoch != epoch {
                self.allocator.release(allocated);
                return Err("superseded by a concurrent operation".to_string());
            }
            rt.allocated_port = Some(allocated);
            port = Some(allocated);
        }

        // Port passing: one <DEP>_PORT per dependency that has a port
        let mut dep_ports = Vec::new();
        for dep in &spec.depends_on {
            if let Some(dep_handle) = self.lookup(&config.id, dep) {
                let rt = dep_handle.runtime.lock().await;
                if let Some(dep_port) = rt.current_port() {
                    dep_ports.push((dep.clone(), dep_port));
                }
            }
        }
        let env = spawn::build_env(spec, port, &dep_ports);
        {
            let mut rt = handle.runtime.lock().await;
            rt.resolved_env = env.clone();
        }

        // Rotate logs: the previous run's current.log is filed under the
        // previous run id before the new child writes anything
        let pipeline = self.pipeline(&config.id, &spec.id).map_err(|e| e.to_string())?;
        let prev_run = handle.runtime.lock().await.run_id.take();
        if let Some(prev) = prev_run {
            if let Err(e) = pipeline.archive(&prev).await {
                warn!(app_id = %spec.id, error = %e, "Failed to archive previous run");
            }
        }
        let run_id = Utc::now().format("%Y-%m-%d-%H-%M-%S").to_string();

        if let Some(build) = &spec.build_command {
            info!(config_id = %config.id, app_id = %spec.id, command = %build, "Running build step");
            let result = run_shell(build, &spec.working_dir, &env)
                .await
                .map_err(|e| e.to_string())?;
            for line in result.stdout.lines() {
                pipeline.append(StreamTag::Stdout, line);
            }
            for line in result.stderr.lines() {
                pipeline.append(StreamTag::Stderr, line);
            }
            if result.exit_code != 0 {
                {
                    let mut rt = handle.runtime.lock().await;
                    if rt.epoch == epoch {
                        rt.exit_code = Some(result.exit_code);
                    }
                }
                return Err(format!(
                    "build failed with exit code {}: {}",
                    result.exit_code,
                    output_tail(&result.stderr, &result.stdout)
                ));
            }
        }

        let handler = self.registry.get(&spec.app_type).map_err(|e| e.to_string())?;
        let command_line = handler.prepare_command(spec, &env);
        let mut child =
            spawn::spawn_child(&command_line, &spec.working_dir, &env).map_err(|e| e.to_string())?;
        let Some(pid) = child.id() else {
            return Err("child exited before a PID could be read".to_string());
        };
        if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
            pipeline.attach(stdout, stderr);
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let mut rt = handle.runtime.lock().await;
            if rt.epoch != epoch {
                shutdown::kill_group(pid);
                return Err("superseded by a concurrent operation".to_string());
            }
            rt.pid = Some(pid);
            rt.started_at = Some(Utc::now());
            rt.run_id = Some(run_id);
            rt.exit_rx = Some(exit_rx.clone());
        }
        self.spawn_exit_waiter(config, spec, handle.clone(), child, exit_tx, epoch);
        debug!(config_id = %config.id, app_id = %spec.id, pid = %pid, "Spawned child");

        match &spec.health_check {
            // Bare liveness: running right after spawn; the exit waiter
            // catches an early death
            None => {
                let mut rt = handle.runtime.lock().await;
                if rt.epoch != epoch || rt.state != AppState::Starting {
                    return Ok(rt.state);
                }
                // The exit waiter no-ops while we are `starting`, so an
                // instant exit must be caught here, under the same lock
                // hold that commits `running` - any exit sent after this
                // check lands in `on_exit` with the state already `running`
                if let Some(code) = *exit_rx.borrow() {
                    rt.exit_code = code;
                    return Err(match code {
                        Some(c) => format!("exited with code {c} during startup"),
                        None => "exited during startup".to_string(),
                    });
                }
                rt.state = AppState::Running;
                let port = rt.current_port();
                drop(rt);
                self.emit(&config.id, &spec.id, AppState::Running, port);
                info!(config_id = %config.id, app_id = %spec.id, "Application running");
                Ok(AppState::Running)
            }
            Some(hc) => {
                self.await_healthy(config, spec, handle, hc, epoch, exit_rx)
                    .await
            }
        }
    }

    /// Poll the prober until the first healthy verdict, the child's exit,
    /// or the startup timeout.
    async fn await_healthy(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &ApplicationSpec,
        handle: &Arc<AppHandle>,
        hc: &HealthCheckSpec,
        epoch: u64,
        exit_rx: watch::Receiver<Option<ExitNotice>>,
    ) -> Result<AppState, String> {
        let timeout_secs = spec
            .startup_timeout_secs
            .unwrap_or_else(|| self.settings.default_startup_timeout_secs())
            .max(1);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        let interval = Duration::from_secs(hc.interval_secs.max(1));

        loop {
            if let Some(code) = *exit_rx.borrow() {
                return Err(match code {
                    Some(c) => format!("exited with code {c} before becoming healthy"),
                    None => "exited before becoming healthy".to_string(),
                });
            }

            let ctx = {
                let rt = handle.runtime.lock().await;
                ProbeContext {
                    pid: rt.pid,
                    allocated_port: rt.current_port(),
                }
            };
            let verdict = self.prober.probe(hc, &ctx).await;

            {
                let mut rt = handle.runtime.lock().await;
                if rt.epoch != epoch || rt.state != AppState::Starting {
                    // A concurrent stop took over; nothing left to do here
                    return Ok(rt.state);
                }
                rt.health = verdict;
                if verdict == HealthVerdict::Healthy {
                    rt.state = AppState::Running;
                    let port = rt.current_port();
                    drop(rt);
                    self.emit(&config.id, &spec.id, AppState::Running, port);
                    info!(config_id = %config.id, app_id = %spec.id, "Application healthy and running");
                    self.spawn_health_loop(config, spec, handle.clone(), hc.clone(), epoch);
                    return Ok(AppState::Running);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "startup timeout after {timeout_secs}s without a healthy probe"
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Commit a startup failure: kill whatever was spawned, release ports,
    /// latch `failed` with the message.
    async fn fail_app(
        &self,
        config_id: &str,
        app_id: &str,
        handle: &Arc<AppHandle>,
        epoch: u64,
        message: &str,
    ) {
        let mut rt = handle.runtime.lock().await;
        if rt.epoch != epoch {
            return;
        }
        if let Some(pid) = rt.pid.take() {
            shutdown::kill_group(pid);
        }
        self.release_ports(&mut rt);
        rt.state = AppState::Failed;
        rt.error_message = Some(message.to_string());
        drop(rt);
        self.emit(config_id, app_id, AppState::Failed, None);
        warn!(config_id = %config_id, app_id = %app_id, "Application failed to start: {message}");
    }

    async fn stop_one(self: &Arc<Self>, config_id: &str, app_id: &str, graceful: bool) -> AppOutcome {
        let Some(handle) = self.lookup(config_id, app_id) else {
            return AppOutcome {
                state: AppState::Stopped,
                error: None,
            };
        };

        let (pid, exit_rx, run_id) = {
            let mut rt = handle.runtime.lock().await;
            // Bumping the epoch cancels pending restarts, health loops and
            // stale exit waiters in one move
            rt.epoch += 1;
            match rt.state {
                AppState::Stopped => {
                    return AppOutcome {
                        state: AppState::Stopped,
                        error: None,
                    };
                }
                AppState::Failed => {
                    self.release_ports(&mut rt);
                    reset_to_stopped(&mut rt);
                    drop(rt);
                    self.emit(config_id, app_id, AppState::Stopped, None);
                    return AppOutcome {
                        state: AppState::Stopped,
                        error: None,
                    };
                }
                AppState::Starting | AppState::Running | AppState::Stopping => {
                    rt.state = AppState::Stopping;
                    (rt.pid, rt.exit_rx.clone(), rt.run_id.take())
                }
            }
        };
        self.emit(config_id, app_id, AppState::Stopping, None);
        info!(config_id = %config_id, app_id = %app_id, graceful = %graceful, "Stopping application");

        if let Some(pid) = pid {
            if graceful {
                shutdown::terminate_group(pid);
                let stop_timeout = Duration::from_secs(self.settings.stop_timeout_secs());
                if !wait_for_exit(exit_rx.clone(), stop_timeout).await {
                    warn!(config_id = %config_id, app_id = %app_id, "Did not exit in time, killing");
                    shutdown::kill_group(pid);
                    wait_for_exit(exit_rx, Duration::from_secs(5)).await;
                }
            } else {
                shutdown::kill_group(pid);
                wait_for_exit(exit_rx, Duration::from_secs(5)).await;
            }
        }

        {
            let mut rt = handle.runtime.lock().await;
            self.release_ports(&mut rt);
            reset_to_stopped(&mut rt);
        }
        if let Some(run_id) = run_id {
            if let Ok(pipeline) = self.pipeline(config_id, app_id) {
                if let Err(e) = pipeline.archive(&run_id).await {
                    warn!(app_id = %app_id, error = %e, "Failed to archive logs on stop");
                }
            }
        }
        self.emit(config_id, app_id, AppState::Stopped, None);
        info!(config_id = %config_id, app_id = %app_id, "Application stopped");
        AppOutcome {
            state: AppState::Stopped,
            error: None,
        }
    }

    /// Reap the child and decide what its exit means for the state machine.
    fn spawn_exit_waiter(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &ApplicationSpec,
        handle: Arc<AppHandle>,
        mut child: tokio::process::Child,
        exit_tx: watch::Sender<Option<ExitNotice>>,
        epoch: u64,
    ) {
        let manager = self.clone();
        let config = config.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(app_id = %spec.id, error = %e, "wait() on child failed");
                    None
                }
            };
            let _ = exit_tx.send(Some(code));
            manager.on_exit(&config, &spec, &handle, epoch, code).await;
        });
    }

    async fn on_exit(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &ApplicationSpec,
        handle: &Arc<AppHandle>,
        epoch: u64,
        code: ExitNotice,
    ) {
        let mut rt = handle.runtime.lock().await;
        if rt.epoch != epoch {
            return;
        }
        match rt.state {
            AppState::Running => {
                let described = code.map_or_else(
                    || "terminated by signal".to_string(),
                    |c| format!("exited with code {c}"),
                );
                warn!(config_id = %config.id, app_id = %spec.id, "Application {described} unexpectedly");
                rt.exit_code = code;
                rt.pid = None;
                rt.health = HealthVerdict::Unhealthy;
                self.release_ports(&mut rt);
                rt.state = AppState::Failed;

                if spec.auto_restart {
                    let now = Utc::now();
                    if rt.restart_budget_left(now) {
                        rt.restart_attempts.push_back(now);
                        let delay = backoff_delay(rt.restart_seq);
                        rt.restart_seq += 1;
                        rt.error_message =
                            Some(format!("{described}; auto-restart in {}s", delay.as_secs()));
                        drop(rt);
                        self.emit(&config.id, &spec.id, AppState::Failed, None);
                        self.spawn_restart(config, spec, handle.clone(), epoch, delay);
                        return;
                    }
                    rt.error_message = Some(
                        "restart budget exhausted (10 restarts in the last hour)".to_string(),
                    );
                    warn!(config_id = %config.id, app_id = %spec.id, "Restart budget exhausted, latching failed");
                } else {
                    rt.error_message = Some(format!("{described} unexpectedly"));
                }
                drop(rt);
                self.emit(&config.id, &spec.id, AppState::Failed, None);
            }
            // Startup failure already recorded; keep the exit code
            AppState::Failed => {
                rt.exit_code = code;
            }
            // Starting: the launch path checks the exit channel itself,
            // under the lock, before committing `running` - for both
            // health-checked and bare-liveness apps.
            // Stopping: stop_one drives the final transition.
            _ => {}
        }
    }

    fn spawn_restart(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &ApplicationSpec,
        handle: Arc<AppHandle>,
        epoch: u64,
        delay: Duration,
    ) {
        let manager = self.clone();
        let config = config.clone();
        let spec = spec.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let rt = handle.runtime.lock().await;
                // A manual stop or start in the meantime cancels the restart
                if rt.epoch != epoch || rt.state != AppState::Failed {
                    debug!(app_id = %spec.id, "Pending auto-restart cancelled");
                    return;
                }
            }
            info!(config_id = %config.id, app_id = %spec.id, "Auto-restarting application");
            let outcome = manager.start_one(&config, &spec, false).await;
            if let Some(error) = outcome.error {
                warn!(config_id = %config.id, app_id = %spec.id, "Auto-restart failed: {error}");
            }
        });
    }

    /// Keep the health verdict current while the app stays `running`.
    fn spawn_health_loop(
        self: &Arc<Self>,
        config: &Configuration,
        spec: &ApplicationSpec,
        handle: Arc<AppHandle>,
        hc: HealthCheckSpec,
        epoch: u64,
    ) {
        let manager = self.clone();
        let config_id = config.id.clone();
        let app_id = spec.id.clone();
        let interval = Duration::from_secs(hc.interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let ctx = {
                    let rt = handle.runtime.lock().await;
                    if rt.epoch != epoch || rt.state != AppState::Running {
                        break;
                    }
                    ProbeContext {
                        pid: rt.pid,
                        allocated_port: rt.current_port(),
                    }
                };
                let verdict = manager.prober.probe(&hc, &ctx).await;
                let mut rt = handle.runtime.lock().await;
                if rt.epoch != epoch || rt.state != AppState::Running {
                    break;
                }
                if rt.health != verdict {
                    debug!(config_id = %config_id, app_id = %app_id, ?verdict, "Health verdict changed");
                }
                rt.health = verdict;
            }
            debug!(config_id = %config_id, app_id = %app_id, "Health loop exiting");
        });
    }

    // ---- plumbing ----

    fn handle(&self, config_id: &str, app_id: &str) -> Arc<AppHandle> {
        let mut apps = self.apps.lock().unwrap();
        apps.entry((config_id.to_string(), app_id.to_string()))
            .or_insert_with(|| {
                Arc::new(AppHandle::new(config_id.to_string(), app_id.to_string()))
            })
            .clone()
    }

    fn lookup(&self, config_id: &str, app_id: &str) -> Option<Arc<AppHandle>> {
        self.apps
            .lock()
            .unwrap()
            .get(&(config_id.to_string(), app_id.to_string()))
            .cloned()
    }

    async fn peek_state(&self, config_id: &str, app_id: &str) -> AppState {
        match self.lookup(config_id, app_id) {
            Some(handle) => handle.runtime.lock().await.state,
            None => AppState::Stopped,
        }
    }

    fn spec_of<'a>(
        &self,
        config: &'a Configuration,
        app_id: &str,
    ) -> Result<&'a ApplicationSpec, SupervisorError> {
        config.application(app_id).ok_or_else(|| {
            SupervisorError::NotFound(format!(
                "application {app_id} in configuration {}",
                config.id
            ))
        })
    }

    fn resolve_targets(
        &self,
        config: &Configuration,
        app_ids: Option<&[String]>,
    ) -> Result<Vec<String>, SupervisorError> {
        match app_ids {
            None => Ok(config.app_ids()),
            Some(ids) => {
                for id in ids {
                    self.spec_of(config, id)?;
                }
                Ok(ids.to_vec())
            }
        }
    }

    fn release_ports(&self, rt: &mut AppRuntime) {
        if let Some(port) = rt.allocated_port.take() {
            self.allocator.release(port);
        }
        if let Some(port) = rt.reserved_fixed_port.take() {
            self.allocator.release(port);
        }
    }

    fn emit(&self, config_id: &str, app_id: &str, state: AppState, port: Option<u16>) {
        let _ = self.events.send(AppEvent::now(config_id, app_id, state, port));
    }
}

fn dependency_map(config: &Configuration) -> HashMap<String, Vec<String>> {
    config
        .applications
        .iter()
        .map(|a| (a.id.clone(), a.depends_on.clone()))
        .collect()
}

fn reset_to_stopped(rt: &mut AppRuntime) {
    rt.state = AppState::Stopped;
    rt.pid = None;
    rt.exit_code = None;
    rt.error_message = None;
    rt.health = HealthVerdict::Unknown;
    rt.started_at = None;
    rt.exit_rx = None;
    rt.resolved_env.clear();
}

/// Last few lines of build output for the error message.
fn output_tail(stderr: &str, stdout: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

async fn wait_for_exit(
    rx: Option<watch::Receiver<Option<ExitNotice>>>,
    timeout: Duration,
) -> bool {
    let Some(mut rx) = rx else {
        return true;
    };
    if rx.borrow().is_some() {
        return true;
    }
    tokio::time::timeout(timeout, rx.wait_for(|v| v.is_some()))
        .await
        .is_ok_and(|r| r.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::HandlerRegistry;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> Arc<ProcessManager> {
        let dirs = DataDirs::prepare(Some(temp.path())).unwrap();
        Arc::new(ProcessManager::new(
            dirs,
            ServerSettings::default(),
            Arc::new(HandlerRegistry::with_builtins()),
        ))
    }

    fn config(apps: Vec<ApplicationSpec>) -> Configuration {
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

    fn sleeper(id: &str, temp: &TempDir) -> ApplicationSpec {
        ApplicationSpec::new(id, "python", temp.path(), "sleep 30")
    }

    #[tokio::test]
    async fn unknown_app_id_is_not_found() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let cfg = config(vec![sleeper("a", &temp)]);
        let err = mgr
            .start(&cfg, Some(&["ghost".to_string()]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn cycle_is_config_invalid() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let mut a = sleeper("a", &temp);
        let mut b = sleeper("b", &temp);
        a.depends_on = vec!["b".to_string()];
        b.depends_on = vec!["a".to_string()];
        let cfg = config(vec![a, b]);
        let err = mgr.start(&cfg, None).await.unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[tokio::test]
    async fn missing_working_dir_fails_the_app() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let mut app = sleeper("a", &temp);
        app.working_dir = temp.path().join("does-not-exist");
        let cfg = config(vec![app]);

        let results = mgr.start(&cfg, None).await.unwrap();
        let outcome = &results["a"];
        assert_eq!(outcome.state, AppState::Failed);
        assert!(outcome.error.as_ref().unwrap().contains("working directory"));
    }

    #[tokio::test]
    async fn unknown_handler_fails_the_app() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let mut app = sleeper("a", &temp);
        app.app_type = "fortran".to_string();
        let cfg = config(vec![app]);

        let results = mgr.start(&cfg, None).await.unwrap();
        assert_eq!(results["a"].state, AppState::Failed);
        assert!(results["a"].error.as_ref().unwrap().contains("fortran"));
    }

    #[tokio::test]
    async fn start_and_stop_roundtrip() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let cfg = config(vec![sleeper("a", &temp)]);

        let results = mgr.start(&cfg, None).await.unwrap();
        assert_eq!(results["a"].state, AppState::Running);
        assert!(mgr.has_running("test").await);

        let status = mgr.status(&cfg, None).await.unwrap();
        assert!(status["a"].pid.is_some());
        assert!(status["a"].started_at.is_some());

        let results = mgr.stop(&cfg, None, true).await.unwrap();
        assert_eq!(results["a"].state, AppState::Stopped);
        assert!(!mgr.has_running("test").await);

        let status = mgr.status(&cfg, None).await.unwrap();
        assert!(status["a"].pid.is_none());
        assert!(status["a"].exit_code.is_none());
    }

    #[tokio::test]
    async fn failed_build_aborts_the_group() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let mut first = sleeper("first", &temp);
        first.build_command = Some("echo compiling >&2; exit 3".to_string());
        let mut second = sleeper("second", &temp);
        second.depends_on = vec!["first".to_string()];
        let cfg = config(vec![first, second]);

        let results = mgr.start(&cfg, None).await.unwrap();
        assert_eq!(results["first"].state, AppState::Failed);
        let error = results["first"].error.as_ref().unwrap();
        assert!(error.contains("exit code 3"));
        assert!(error.contains("compiling"));
        assert_eq!(
            results["second"].error.as_deref(),
            Some("group start aborted")
        );

        let status = mgr.status(&cfg, None).await.unwrap();
        assert_eq!(status["first"].exit_code, Some(3));
        assert_eq!(status["second"].state, AppState::Stopped);
    }

    #[tokio::test]
    async fn fixed_port_conflict_fails_second_app() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut a = sleeper("a", &temp);
        a.port = Some(port);
        let mut b = sleeper("b", &temp);
        b.port = Some(port);
        let cfg = config(vec![a, b]);

        let results = mgr.start(&cfg, None).await.unwrap();
        assert_eq!(results["a"].state, AppState::Running);
        assert_eq!(results["b"].state, AppState::Failed);
        assert!(results["b"].error.as_ref().unwrap().contains("port"));

        // Stopping releases the reservation, so the port is startable again
        mgr.stop(&cfg, None, true).await.unwrap();
        let results = mgr.start(&cfg, Some(&["b".to_string()])).await.unwrap();
        assert_eq!(results["b"].state, AppState::Running);
        mgr.stop(&cfg, None, true).await.unwrap();
    }

    #[tokio::test]
    async fn run_command_dispatches_through_handler() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let cfg = config(vec![sleeper("a", &temp)]);

        let result = mgr
            .run_command(&cfg, "a", "echo hello", &[])
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let cfg = config(vec![sleeper("a", &temp)]);
        let mut events = mgr.subscribe();

        mgr.start(&cfg, None).await.unwrap();
        mgr.stop(&cfg, None, true).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![
                AppState::Starting,
                AppState::Running,
                AppState::Stopping,
                AppState::Stopped
            ]
        );
    }
}
