//! Per-family process handlers.
//!
//! A handler adapts one process family (python, node-package, sbt) to the
//! uniform control contract the process manager speaks: command
//! preparation, reload capability, and recognised custom subcommands. The
//! built-in handlers differ only in their mapping tables; new families are
//! added by registering another implementation under a new tag, with no
//! change to the process manager.

mod node;
mod python;
mod sbt;

pub use node::NodeHandler;
pub use python::PythonHandler;
pub use sbt::SbtHandler;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use csrunner_core::{ApplicationSpec, SupervisorError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Result of a custom command run through a handler.
///
/// A non-zero `exit_code` is a successful dispatch; the caller decides what
/// to make of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

/// Family-specific knowledge behind a uniform contract.
#[async_trait]
pub trait Handler: Send + Sync + std::fmt::Debug {
    /// Rewrite or wrap the raw start command. Pure and idempotent.
    fn prepare_command(&self, spec: &ApplicationSpec, env: &HashMap<String, String>) -> String;

    /// Static inspection: does this command run something that reloads
    /// itself on file changes?
    fn supports_reload(&self, spec: &ApplicationSpec) -> bool;

    /// Nudge a reload-capable process, usually by touching a watched file.
    /// Returns `(false, reason)` when the command has no reload mode.
    async fn trigger_reload(&self, spec: &ApplicationSpec) -> (bool, String);

    /// Map a recognised subcommand (`lint`, `format`, `test`, `typecheck`,
    /// `build`, `compile`, `clean`) to the family's tool chain. `None`
    /// passes the command string through verbatim.
    fn subcommand(&self, command: &str) -> Option<String>;

    /// Execute a custom command synchronously in the spec's working
    /// directory with the resolved environment.
    async fn run_custom_command(
        &self,
        spec: &ApplicationSpec,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<CommandResult, SupervisorError> {
        let mut line = self
            .subcommand(command)
            .unwrap_or_else(|| command.to_string());
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        debug!(app_id = %spec.id, command = %line, "Running custom command");
        run_shell(&line, &spec.working_dir, env).await
    }
}

/// Run a command line through `sh -c`, capturing output.
pub(crate) async fn run_shell(
    line: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> Result<CommandResult, SupervisorError> {
    let started = Instant::now();
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(line)
        .current_dir(working_dir)
        .envs(env)
        .output()
        .await
        .map_err(|e| SupervisorError::internal(format!("cannot run `{line}`: {e}")))?;

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

/// Touch `path` so file-watching dev servers notice a change.
pub(crate) fn touch(path: &Path) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().append(true).open(path)?;
    file.set_modified(std::time::SystemTime::now())
}

/// Maps `app_type` tags to handlers.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Registry with the three built-in families.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register("python", Arc::new(PythonHandler));
        registry.register("npm", Arc::new(NodeHandler));
        registry.register("scala", Arc::new(SbtHandler));
        registry
    }

    /// Register (or replace) a handler under `tag`.
    pub fn register(&mut self, tag: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(tag.into(), handler);
    }

    /// Look up the handler for an `app_type` tag.
    pub fn get(&self, app_type: &str) -> Result<Arc<dyn Handler>, SupervisorError> {
        self.handlers
            .get(app_type)
            .cloned()
            .ok_or_else(|| SupervisorError::HandlerMissing {
                app_type: app_type.to_string(),
            })
    }
}
