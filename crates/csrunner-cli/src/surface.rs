//! The control surface: line-delimited JSON request/reply over any byte
//! streams (standard I/O in production, in-memory duplexes in tests).
//!
//! Each request is `{"id": n, "verb": "...", "params": {...}}`; each reply
//! `{"id": n, "ok": true, "result": ...}` or `{"id": n, "ok": false,
//! "error": {"kind": ..., "message": ...}}`. Manager errors map 1:1 onto
//! the wire taxonomy via `SupervisorError::kind`.

use std::sync::Arc;

use csrunner_core::{ConfigurationUpdate, NewConfiguration, SupervisorError};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::Supervisor;

/// One request line.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: u64,
    pub verb: String,
    #[serde(default)]
    pub params: Value,
}

/// One reply line.
#[derive(Debug, Serialize)]
pub struct Reply {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Wire shape of a `SupervisorError`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Reply {
    fn result(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: u64, err: &SupervisorError) -> Self {
        let mut body = ErrorBody {
            kind: err.kind().to_string(),
            message: err.to_string(),
            cycle: None,
            exit_code: None,
            tail: None,
            correlation_id: None,
        };
        match err {
            SupervisorError::ConfigInvalid { cycle, .. } => body.cycle.clone_from(cycle),
            SupervisorError::BuildFailed { exit_code, tail } => {
                body.exit_code = Some(*exit_code);
                body.tail = Some(tail.clone());
            }
            SupervisorError::CommandFailed { exit_code } => body.exit_code = Some(*exit_code),
            SupervisorError::Internal { correlation_id, .. } => {
                body.correlation_id = Some(correlation_id.clone());
            }
            _ => {}
        }
        Self {
            id,
            ok: false,
            result: None,
            error: Some(body),
        }
    }
}

// ---- per-verb parameter shapes ----

const fn default_true() -> bool {
    true
}

const fn default_lines() -> usize {
    100
}

const fn default_max_results() -> usize {
    100
}

#[derive(Deserialize)]
struct ConfigTarget {
    config_id: String,
    #[serde(default)]
    app_ids: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ConfigId {
    config_id: String,
}

#[derive(Deserialize)]
struct DeleteParams {
    config_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Deserialize)]
struct UpdateParams {
    config_id: String,
    updates: ConfigurationUpdate,
}

#[derive(Deserialize)]
struct StopParams {
    config_id: String,
    #[serde(default)]
    app_ids: Option<Vec<String>>,
    #[serde(default = "default_true")]
    graceful: bool,
}

#[derive(Deserialize)]
struct AppTarget {
    config_id: String,
    app_id: String,
}

#[derive(Deserialize)]
struct LogsParams {
    config_id: String,
    app_id: String,
    #[serde(default = "default_lines")]
    lines: usize,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Deserialize)]
struct SearchParams {
    config_id: String,
    app_id: String,
    query: String,
    #[serde(default = "default_max_results")]
    max_results: usize,
    #[serde(default)]
    case_sensitive: bool,
}

#[derive(Deserialize)]
struct RunCommandParams {
    config_id: String,
    app_id: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

fn params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, SupervisorError> {
    serde_json::from_value(value)
        .map_err(|e| SupervisorError::config_invalid(format!("invalid parameters: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, SupervisorError> {
    serde_json::to_value(value)
        .map_err(|e| SupervisorError::internal(format!("serialize reply: {e}")))
}

/// Route one request to the supervisor.
pub async fn dispatch(supervisor: &Supervisor, request: Request) -> Reply {
    let id = request.id;
    debug!(id = %id, verb = %request.verb, "Dispatching request");
    match handle(supervisor, request).await {
        Ok(result) => Reply::result(id, result),
        Err(err) => Reply::error(id, &err),
    }
}

async fn handle(supervisor: &Supervisor, request: Request) -> Result<Value, SupervisorError> {
    match request.verb.as_str() {
        "list_configurations" => to_value(&supervisor.list_configurations().await?),
        "create_configuration" => {
            let new: NewConfiguration = params(request.params)?;
            let config = supervisor.create_configuration(new).await?;
            Ok(json!({ "id": config.id }))
        }
        "get_configuration" => {
            let p: ConfigId = params(request.params)?;
            to_value(&supervisor.get_configuration(&p.config_id)?)
        }
        "update_configuration" => {
            let p: UpdateParams = params(request.params)?;
            to_value(&supervisor.update_configuration(&p.config_id, p.updates).await?)
        }
        "delete_configuration" => {
            let p: DeleteParams = params(request.params)?;
            supervisor.delete_configuration(&p.config_id, p.force).await?;
            Ok(json!({ "ok": true }))
        }
        "start_configuration" => {
            let p: ConfigTarget = params(request.params)?;
            let result = supervisor
                .start_configuration(&p.config_id, p.app_ids.as_deref())
                .await?;
            Ok(json!({ "per_app": result }))
        }
        "stop_configuration" => {
            let p: StopParams = params(request.params)?;
            let result = supervisor
                .stop_configuration(&p.config_id, p.app_ids.as_deref(), p.graceful)
                .await?;
            Ok(json!({ "per_app": result }))
        }
        "restart_configuration" => {
            let p: ConfigTarget = params(request.params)?;
            let result = supervisor
                .restart_configuration(&p.config_id, p.app_ids.as_deref())
                .await?;
            Ok(json!({ "per_app": result }))
        }
        "get_status" => {
            let p: ConfigTarget = params(request.params)?;
            to_value(&supervisor.get_status(&p.config_id, p.app_ids.as_deref()).await?)
        }
        "get_logs" => {
            let p: LogsParams = params(request.params)?;
            to_value(
                &supervisor
                    .get_logs(&p.config_id, &p.app_id, p.lines, p.run_id.as_deref())
                    .await?,
            )
        }
        "search_logs" => {
            let p: SearchParams = params(request.params)?;
            to_value(
                &supervisor
                    .search_logs(
                        &p.config_id,
                        &p.app_id,
                        &p.query,
                        p.max_results,
                        p.case_sensitive,
                    )
                    .await?,
            )
        }
        "list_log_runs" => {
            let p: AppTarget = params(request.params)?;
            to_value(&supervisor.list_log_runs(&p.config_id, &p.app_id)?)
        }
        "run_command" => {
            let p: RunCommandParams = params(request.params)?;
            to_value(
                &supervisor
                    .run_command(&p.config_id, &p.app_id, &p.command, &p.args)
                    .await?,
            )
        }
        "trigger_reload" => {
            let p: AppTarget = params(request.params)?;
            let (ok, message) = supervisor.trigger_reload(&p.config_id, &p.app_id).await?;
            Ok(json!({ "ok": ok, "message": message }))
        }
        other => Err(SupervisorError::NotFound(format!("verb {other}"))),
    }
}

/// Serve requests line-by-line until the input closes.
pub async fn serve<R, W>(
    supervisor: Arc<Supervisor>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&supervisor, request).await,
            Err(e) => Reply::error(
                0,
                &SupervisorError::internal(format!("malformed request: {e}")),
            ),
        };
        let mut out = serde_json::to_vec(&reply).unwrap_or_else(|_| {
            br#"{"id":0,"ok":false,"error":{"kind":"internal","message":"reply serialization failed"}}"#
                .to_vec()
        });
        out.push(b'\n');
        writer.write_all(&out).await?;
        writer.flush().await?;
    }
    Ok(())
}
