//! Child environment construction and spawning.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use csrunner_core::ApplicationSpec;
use tokio::process::{Child, Command};

/// Environment variable name a dependency's port is exported under:
/// upper-cased dependency id, non-alphanumerics mapped to `_`, plus `_PORT`.
pub(crate) fn port_env_name(dep_id: &str) -> String {
    let mut name: String = dep_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    name.push_str("_PORT");
    name
}

/// Resolve the child environment: OS environment, overlaid with the spec's
/// entries, the app's own port variable, and one `<DEP>_PORT` per
/// dependency that has a port.
pub(crate) fn build_env(
    spec: &ApplicationSpec,
    port: Option<u16>,
    dep_ports: &[(String, u16)],
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(spec.env.clone());
    if let (Some(var), Some(port)) = (&spec.port_env_var, port) {
        env.insert(var.clone(), port.to_string());
    }
    for (dep_id, dep_port) in dep_ports {
        env.insert(port_env_name(dep_id), dep_port.to_string());
    }
    env
}

/// Spawn a prepared command line through `sh -c` with piped stdio, in its
/// own process group so stop can signal the whole tree.
pub(crate) fn spawn_child(
    line: &str,
    working_dir: &Path,
    env: &HashMap<String, String>,
) -> Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(line)
        .current_dir(working_dir)
        .env_clear()
        .envs(env)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
        .with_context(|| format!("failed to spawn `{line}`"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_env_names_are_upper_snake() {
        assert_eq!(port_env_name("backend"), "BACKEND_PORT");
        assert_eq!(port_env_name("my-api"), "MY_API_PORT");
        assert_eq!(port_env_name("svc.v2"), "SVC_V2_PORT");
    }

    #[test]
    fn env_layers_in_order() {
        let mut spec = ApplicationSpec::new("web", "npm", "/tmp", "npm run dev");
        spec.env.insert("NODE_ENV".to_string(), "production".to_string());
        spec.port_env_var = Some("PORT".to_string());

        let env = build_env(&spec, Some(9001), &[("backend".to_string(), 9000)]);
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("production"));
        assert_eq!(env.get("PORT").map(String::as_str), Some("9001"));
        assert_eq!(env.get("BACKEND_PORT").map(String::as_str), Some("9000"));
        // OS environment still present underneath
        assert!(env.contains_key("PATH"));
    }

    #[test]
    fn spec_env_overrides_os_env() {
        let mut spec = ApplicationSpec::new("web", "npm", "/tmp", "npm run dev");
        spec.env.insert("PATH".to_string(), "/opt/custom/bin".to_string());
        let env = build_env(&spec, None, &[]);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/opt/custom/bin"));
    }

    #[tokio::test]
    async fn spawned_child_sees_the_environment() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut spec = ApplicationSpec::new("app", "python", "/tmp", "unused");
        spec.env.insert("GREETING".to_string(), "hello".to_string());

        let env = build_env(&spec, None, &[]);
        let mut child = spawn_child("echo \"$GREETING\"", temp.path(), &env).unwrap();
        let stdout = child.stdout.take().unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());

        use tokio::io::AsyncReadExt as _;
        let mut out = String::new();
        tokio::io::BufReader::new(stdout)
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
