//! Process-group termination with SIGTERM → SIGKILL escalation.
//!
//! Children are spawned in their own process group, so signals target the
//! whole tree (a `sh -c` wrapper plus whatever it exec'd or forked). The
//! exit waiter owns the `Child` handle and does the reaping; these helpers
//! only send signals.

use tracing::debug;

/// Ask a process group to shut down (SIGTERM on unix).
pub(crate) fn terminate_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        match killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => debug!(pid = %pid, "Sent SIGTERM to process group"),
            // ESRCH: already gone
            Err(e) => debug!(pid = %pid, error = %e, "SIGTERM delivery failed"),
        }
    }

    #[cfg(not(unix))]
    {
        // No graceful signal available off unix; go straight to kill
        kill_group(pid);
    }
}

/// Forcibly kill a process group (SIGKILL on unix).
pub(crate) fn kill_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid = %pid, "Sent SIGKILL to process group"),
            Err(e) => debug!(pid = %pid, error = %e, "SIGKILL delivery failed"),
        }
    }

    #[cfg(not(unix))]
    {
        use sysinfo::{Pid, System};
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), false);
        if let Some(process) = system.process(Pid::from_u32(pid)) {
            process.kill();
            debug!(pid = %pid, "Killed process");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn terminate_reaches_the_whole_group() {
        // sh spawns a sleep child; killing the group must take out both
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        terminate_group(pid);
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .expect("child did not exit after SIGTERM")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn kill_handles_already_dead_group() {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg("exit 0").process_group(0);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        // Must not panic on ESRCH
        kill_group(pid);
        terminate_group(pid);
    }
}
