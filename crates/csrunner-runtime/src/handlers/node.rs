//! Handler for node-package applications.

use std::collections::HashMap;

use async_trait::async_trait;
use csrunner_core::ApplicationSpec;

use super::{Handler, touch};

#[derive(Debug)]
pub struct NodeHandler;

fn is_dev_server(command: &str) -> bool {
    // `dev` must be its own token ("npm run dev", "next dev"); the others
    // are distinctive enough as substrings.
    command.split_whitespace().any(|t| t == "dev")
        || command.contains("nodemon")
        || command.contains("watch")
        || command.contains("vite")
}

#[async_trait]
impl Handler for NodeHandler {
    fn prepare_command(&self, spec: &ApplicationSpec, _env: &HashMap<String, String>) -> String {
        spec.command.trim().to_string()
    }

    fn supports_reload(&self, spec: &ApplicationSpec) -> bool {
        is_dev_server(&spec.command)
    }

    async fn trigger_reload(&self, spec: &ApplicationSpec) -> (bool, String) {
        if !self.supports_reload(spec) {
            return (
                false,
                "command is not a watching dev server".to_string(),
            );
        }
        let path = spec.working_dir.join("package.json");
        match touch(&path) {
            Ok(()) => (true, "touched package.json".to_string()),
            Err(e) => (false, format!("cannot touch package.json: {e}")),
        }
    }

    fn subcommand(&self, command: &str) -> Option<String> {
        let line = match command {
            "lint" => "npm run lint",
            "format" => "npm run format",
            "test" => "npm test",
            "typecheck" => "npm run typecheck",
            "build" | "compile" => "npm run build",
            "clean" => "npm run clean",
            _ => return None,
        };
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> ApplicationSpec {
        ApplicationSpec::new("web", "npm", "/tmp", command)
    }

    #[test]
    fn reload_detection() {
        let handler = NodeHandler;
        assert!(handler.supports_reload(&spec("npm run dev")));
        assert!(handler.supports_reload(&spec("nodemon server.js")));
        assert!(handler.supports_reload(&spec("vite")));
        assert!(!handler.supports_reload(&spec("node server.js")));
        // "dev" must be a whole token
        assert!(!handler.supports_reload(&spec("node devices.js")));
    }

    #[test]
    fn build_and_compile_share_a_script() {
        let handler = NodeHandler;
        assert_eq!(handler.subcommand("build"), handler.subcommand("compile"));
        assert_eq!(handler.subcommand("test").as_deref(), Some("npm test"));
    }

    #[tokio::test]
    async fn trigger_reload_touches_package_json() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), "{}").unwrap();

        let mut app = spec("npm run dev");
        app.working_dir = temp.path().to_path_buf();

        let handler = NodeHandler;
        let (ok, message) = handler.trigger_reload(&app).await;
        assert!(ok, "{message}");
    }
}
