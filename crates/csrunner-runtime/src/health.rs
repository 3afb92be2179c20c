//! One-shot health probes.
//!
//! The prober is stateless per call and never loops; the process manager
//! owns the looping and the verdict bookkeeping. No probe blocks longer
//! than its configured timeout.

use std::time::Duration;

use csrunner_core::{HealthCheckKind, HealthCheckSpec, HealthVerdict};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

/// Runtime context a probe may need: the child's PID and any allocated port.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeContext {
    pub pid: Option<u32>,
    pub allocated_port: Option<u16>,
}

/// Executes http / tcp / process probes.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
}

impl Default for HealthProber {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthProber {
    pub fn new() -> Self {
        // Per-request timeouts come from the spec; no client-wide default
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Run one probe and report the verdict.
    pub async fn probe(&self, spec: &HealthCheckSpec, ctx: &ProbeContext) -> HealthVerdict {
        match spec.kind {
            HealthCheckKind::Http => self.probe_http(spec).await,
            HealthCheckKind::Tcp => Self::probe_tcp(spec, ctx).await,
            HealthCheckKind::Process => Self::probe_process(ctx),
        }
    }

    /// GET the URL; 2xx/3xx is healthy, network errors and timeouts are not.
    async fn probe_http(&self, spec: &HealthCheckSpec) -> HealthVerdict {
        let Some(url) = spec.url.as_deref() else {
            return HealthVerdict::Unknown;
        };
        let request = self
            .client
            .get(url)
            .timeout(Duration::from_secs(spec.timeout_secs));
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    HealthVerdict::Healthy
                } else {
                    debug!(%url, status = %status, "HTTP probe returned non-2xx/3xx");
                    HealthVerdict::Unhealthy
                }
            }
            Err(e) => {
                debug!(%url, error = %e, "HTTP probe failed");
                HealthVerdict::Unhealthy
            }
        }
    }

    /// Connect to loopback:(spec port or allocated port) within the timeout.
    async fn probe_tcp(spec: &HealthCheckSpec, ctx: &ProbeContext) -> HealthVerdict {
        let Some(port) = spec.port.or(ctx.allocated_port) else {
            return HealthVerdict::Unknown;
        };
        let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
        match tokio::time::timeout(Duration::from_secs(spec.timeout_secs), connect).await {
            Ok(Ok(_stream)) => HealthVerdict::Healthy,
            Ok(Err(e)) => {
                debug!(port = %port, error = %e, "TCP probe refused");
                HealthVerdict::Unhealthy
            }
            Err(_) => {
                debug!(port = %port, "TCP probe timed out");
                HealthVerdict::Unhealthy
            }
        }
    }

    /// Live and not a zombie.
    fn probe_process(ctx: &ProbeContext) -> HealthVerdict {
        let Some(pid) = ctx.pid else {
            return HealthVerdict::Unknown;
        };
        if is_process_alive(pid) {
            HealthVerdict::Healthy
        } else {
            HealthVerdict::Unhealthy
        }
    }
}

/// Check that a PID exists and is not a zombie.
pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), false);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}
