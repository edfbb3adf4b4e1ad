//! berth-daemon - coordinating server for the agent docking protocol.
//!
//! Binds the dock socket, spawns the heartbeat reaper and the
//! lifecycle-event observer, and serves connections until SIGINT or
//! SIGTERM.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use berth_core::config::BerthConfig;
use berth_daemon::protocol::{serve, SocketManager, SocketManagerConfig};
use berth_daemon::{DaemonState, HeartbeatReaper};

/// berth daemon - agent docking coordinator
#[derive(Parser, Debug)]
#[command(name = "berth-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "berth.toml")]
    config: PathBuf,

    /// Override the dock socket path
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = BerthConfig::load_or_default(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let socket_config = SocketManagerConfig::new(&config.socket_path)
        .with_max_connections(config.max_connections);
    let state = DaemonState::new(config).shared();
    let manager = SocketManager::bind(socket_config).context("binding dock socket")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Heartbeat reaper: the only inactivity-demotion path.
    let reaper = HeartbeatReaper::new(state.clone());
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx.clone()));

    // Notification fan-out observer: lifecycle events go to the log.
    let mut events = state.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(dock_id = event.dock_id(), ?event, "session lifecycle"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "lifecycle observer lagged");
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let server = tokio::spawn(serve(manager, state, shutdown_rx));

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    shutdown_tx.send(true).ok();
    if let Err(e) = server.await.context("joining server task")? {
        warn!(error = %e, "server exited with error");
    }
    reaper_handle.await.context("joining reaper task")?;
    info!("daemon stopped");
    Ok(())
}
