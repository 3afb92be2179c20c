//! Handler for generic interpreted python applications.

use std::collections::HashMap;

use async_trait::async_trait;
use csrunner_core::ApplicationSpec;

use super::{Handler, touch};

/// Substrings that mark a python command as self-reloading.
const RELOAD_MARKERS: [&str; 3] = ["--reload", "--debug", "runserver"];

#[derive(Debug)]
pub struct PythonHandler;

#[async_trait]
impl Handler for PythonHandler {
    fn prepare_command(&self, spec: &ApplicationSpec, _env: &HashMap<String, String>) -> String {
        spec.command.trim().to_string()
    }

    fn supports_reload(&self, spec: &ApplicationSpec) -> bool {
        RELOAD_MARKERS.iter().any(|m| spec.command.contains(m))
    }

    async fn trigger_reload(&self, spec: &ApplicationSpec) -> (bool, String) {
        if !self.supports_reload(spec) {
            return (
                false,
                "command has no reload mode (--reload, --debug or runserver)".to_string(),
            );
        }
        // Reloading dev servers watch their source files; touching the entry
        // module is enough to make them cycle.
        let Some(entry) = spec
            .command
            .split_whitespace()
            .find(|token| token.ends_with(".py"))
        else {
            return (false, "no .py entry point found in command".to_string());
        };
        let path = spec.working_dir.join(entry);
        match touch(&path) {
            Ok(()) => (true, format!("touched {entry}")),
            Err(e) => (false, format!("cannot touch {entry}: {e}")),
        }
    }

    fn subcommand(&self, command: &str) -> Option<String> {
        let line = match command {
            "lint" => "ruff check .",
            "format" => "ruff format .",
            "test" => "pytest",
            "typecheck" => "mypy .",
            "build" => "python -m build",
            "compile" => "python -m compileall .",
            "clean" => "rm -rf build dist __pycache__ .pytest_cache",
            _ => return None,
        };
        Some(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str) -> ApplicationSpec {
        ApplicationSpec::new("app", "python", "/tmp", command)
    }

    #[test]
    fn reload_detection() {
        let handler = PythonHandler;
        assert!(handler.supports_reload(&spec("uvicorn app:app --reload")));
        assert!(handler.supports_reload(&spec("flask run --debug")));
        assert!(handler.supports_reload(&spec("python manage.py runserver")));
        assert!(!handler.supports_reload(&spec("python worker.py")));
    }

    #[test]
    fn prepare_is_identity_modulo_whitespace() {
        let handler = PythonHandler;
        let prepared = handler.prepare_command(&spec("  python app.py "), &HashMap::new());
        assert_eq!(prepared, "python app.py");
    }

    #[test]
    fn subcommand_table() {
        let handler = PythonHandler;
        assert_eq!(handler.subcommand("test").as_deref(), Some("pytest"));
        assert_eq!(handler.subcommand("lint").as_deref(), Some("ruff check ."));
        assert!(handler.subcommand("deploy").is_none());
    }

    #[tokio::test]
    async fn trigger_reload_refuses_non_reloading_command() {
        let handler = PythonHandler;
        let (ok, reason) = handler.trigger_reload(&spec("python worker.py")).await;
        assert!(!ok);
        assert!(reason.contains("no reload mode"));
    }

    #[tokio::test]
    async fn trigger_reload_touches_entry_point() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("manage.py"), "# entry").unwrap();

        let mut app = spec("python manage.py runserver");
        app.working_dir = temp.path().to_path_buf();

        let handler = PythonHandler;
        let (ok, message) = handler.trigger_reload(&app).await;
        assert!(ok, "{message}");
        assert!(message.contains("manage.py"));
    }
}
