//! `stagehand run` command.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use stagehand_host::config::{DeploymentKind, OrchestratorConfig};
use stagehand_host::control::ControlServer;
use stagehand_host::{Orchestrator, OrchestratorDaemon};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

use crate::opts::GlobalOpts;
use crate::output::print_success;

use super::try_control_client;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Deployment provider: local-process, container or cloud (env: STAGEHAND_DEPLOYMENT)
    #[arg(long)]
    pub deployment: Option<DeploymentKind>,

    /// How long a detached kernel lingers before shutdown, in milliseconds
    #[arg(long)]
    pub detach_grace_ms: Option<u64>,

    /// Interval of reserve housekeeping, in seconds
    #[arg(long)]
    pub housekeeping_secs: Option<u64>,
}

pub async fn cmd_run(opts: &GlobalOpts, args: &RunArgs) -> Result<()> {
    let control_path = opts.control_socket();
    if control_path.exists() {
        if let Some(mut client) = try_control_client(opts).await {
            if let Ok(resp) = client.send("catalog", json!({})).await {
                if resp.ok {
                    return print_success(
                        opts,
                        json!({ "daemon": "running", "socket": control_path }),
                        vec![],
                    );
                }
            }
        }
        anyhow::bail!(
            "Control socket {} exists but is unhealthy. \
             If the daemon is not running, delete the socket and retry.",
            control_path.display()
        );
    }

    let mut config =
        OrchestratorConfig::from_env_and_file(Path::new(".env")).context("read configuration")?;
    if let Some(kind) = args.deployment {
        config.deployment = kind;
    }
    if let Some(ms) = args.detach_grace_ms {
        config.detach_grace = Duration::from_millis(ms);
    }
    if let Some(secs) = args.housekeeping_secs {
        config.housekeeping_interval = Duration::from_secs(secs.max(1));
    }
    run_daemon(config, &control_path).await
}

async fn run_daemon(config: OrchestratorConfig, control_path: &Path) -> Result<()> {
    setup_logging();

    if let Some(dir) = control_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create control socket directory {}", dir.display()))?;
    }
    let orchestrator = Orchestrator::from_config(config).context("build orchestrator")?;

    let (control_tx, control_rx) = mpsc::channel(128);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Ctrl-C and SIGTERM shut down gracefully.
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down");
            }
        }
        let _ = shutdown_tx_clone.send(());
    });

    let server = ControlServer::new(control_path, control_tx, shutdown_tx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!("control server error: {e}");
        }
    });

    let mut daemon = OrchestratorDaemon::new(orchestrator, control_rx, shutdown_rx, Some(server_handle));
    daemon.run().await?;
    Ok(())
}

/// Daemon logs go to stderr, filtered by `RUST_LOG` (default `info`).
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}
