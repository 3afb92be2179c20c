//! Handler for sbt-style scala applications.

use std::collections::HashMap;

use async_trait::async_trait;
use csrunner_core::ApplicationSpec;

use super::Handler;

#[derive(Debug)]
pub struct SbtHandler;

#[async_trait]
impl Handler for SbtHandler {
    /// Quote `~`-prefixed watch tasks: the child is launched through a
    /// shell, and an unquoted `~run` is a username expansion there.
    fn prepare_command(&self, spec: &ApplicationSpec, _env: &HashMap<String, String>) -> String {
        spec.command
            .split_whitespace()
            .map(|token| {
                if token.starts_with('~') {
                    format!("'{token}'")
                } else {
                    token.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn supports_reload(&self, spec: &ApplicationSpec) -> bool {
        spec.command.contains("~run") || spec.command.contains("~reStart")
    }

    async fn trigger_reload(&self, spec: &ApplicationSpec) -> (bool, String) {
        if self.supports_reload(spec) {
            (
                false,
                "sbt watch mode recompiles on source change; no manual trigger".to_string(),
            )
        } else {
            (false, "command is not an sbt watch task".to_string())
        }
    }

    fn subcommand(&self, command: &str) -> Option<String> {
        let line = match command {
            "lint" => "sbt scalafmtCheck",
            "format" => "sbt scalafmt",
            "test" => "sbt test",
            "typecheck" | "compile" => "sbt compile",
            "build" => "sbt package",
            "clean" => "sbt clean",
            _ => return None,
        };
        Some(line.to_string())
    }
}
