//! CLI entry point - the composition root.
//!
//! Resolves the data directory, initialises tracing, wires the supervisor
//! and runs the control surface on standard I/O until the input closes or a
//! termination signal arrives, then drains the process manager.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use csrunner_cli::{Supervisor, serve};
use csrunner_core::DataDirs;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csrunner", version, about = "Local supervisor for groups of long-running applications")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory (default: $HOME/.clientserverrunner)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log verbosity; RUST_LOG overrides when set
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control surface on standard I/O (the default)
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // The only subcommand is serve, which is also the default
    let Command::Serve = cli.command.unwrap_or(Command::Serve);

    let dirs = match DataDirs::prepare(cli.data_dir.as_deref()) {
        Ok(dirs) => dirs,
        Err(e) => {
            error!(error = %e, "Cannot prepare data directory");
            return ExitCode::from(2);
        }
    };
    info!(data_dir = %dirs.root().display(), "csrunner starting");

    let supervisor = match Supervisor::new(dirs) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Supervisor initialisation failed");
            return ExitCode::from(1);
        }
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = serve(supervisor.clone(), stdin, stdout) => {
            if let Err(e) = result {
                error!(error = %e, "Control surface I/O error");
            } else {
                info!("Input closed");
            }
        }
        () = wait_for_termination() => {
            info!("Termination signal received");
        }
    }

    supervisor.shutdown().await;
    info!("Clean shutdown");
    ExitCode::SUCCESS
}
