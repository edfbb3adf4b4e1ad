//! berth-agent - docks with the daemon and runs until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use berth_agent::{AgentClient, AgentSettings};
use berth_core::config::BerthConfig;
use berth_core::messages::OperationResponse;

/// berth agent - remote worker client
#[derive(Parser, Debug)]
#[command(name = "berth-agent")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "berth.toml")]
    config: PathBuf,

    /// Logical agent identity
    #[arg(long)]
    agent_id: String,

    /// Override the dock socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Patron identity to verify after docking
    #[arg(long, requires = "patron_secret")]
    patron_identity: Option<String>,

    /// Patron secret for the verification
    #[arg(long, requires = "patron_identity")]
    patron_secret: Option<String>,

    /// Final result payload reported at completion (JSON)
    #[arg(long, default_value = "{}")]
    result: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let result: serde_json::Value =
        serde_json::from_str(&args.result).context("parsing --result as JSON")?;
    let patron_secret = args.patron_secret.map(SecretString::new);

    let mut config = BerthConfig::load_or_default(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let settings = AgentSettings::from_config(&config, &args.agent_id);
    let mut client = AgentClient::new(settings);
    client.dock().await.context("docking failed")?;

    if let Some(identity) = &args.patron_identity {
        let secret = patron_secret
            .as_ref()
            .expect("clap enforces patron_secret with patron_identity");
        match client.verify_patron(identity, secret.expose_secret()).await {
            Ok(OperationResponse::PatronVerification {
                verified: true,
                patron_id,
                ..
            }) => info!(?patron_id, "patron verified"),
            Ok(_) => warn!("patron verification failed"),
            Err(e) => warn!(error = %e, "patron verification errored"),
        }
    }

    info!("docked; press Ctrl-C to undock");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    client.undock(result).await;
    info!("agent stopped");
    Ok(())
}
