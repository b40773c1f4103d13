//! Swarmveil daemon
//!
//! Loads configuration and the sealed identity, runs a tunnel node,
//! and serves the status API until interrupted.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarmveil_common::TunnelConfig;
use swarmveil_core::{NetworkIdentity, TunnelNode};
use swarmveil_daemon::ApiServer;
use tracing::{info, warn, Level};

/// Default bind for the status API. One above the overlay port.
const DEFAULT_API_ADDR: &str = "127.0.0.1:7749";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("starting swarmveil daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&PathBuf::from("swarmveil.toml"))?;
    let identity = load_identity(Path::new("swarmveil.key"))?;

    let node = TunnelNode::bind(config, identity).await?;
    info!(peer = %node.peer_id().short(), addr = %node.local_addr(), "node running");

    node.bootstrap_round().await;

    let api_addr: SocketAddr = DEFAULT_API_ADDR.parse()?;
    let api = ApiServer::new(api_addr, Arc::clone(&node));
    tokio::spawn(async move {
        if let Err(err) = api.start().await {
            warn!("API server stopped: {err}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.shutdown().await;

    Ok(())
}

fn load_config(path: &Path) -> Result<TunnelConfig> {
    if path.exists() {
        info!("loading configuration from {}", path.display());
        return Ok(TunnelConfig::from_file(path)?);
    }

    info!("no configuration file found, using defaults");
    let config = TunnelConfig::default();
    if let Err(err) = config.to_file(path) {
        warn!("could not save default config: {err}");
    } else {
        info!("saved default configuration to {}", path.display());
    }
    Ok(config)
}

/// Load the sealed identity, generating one on first run. The
/// passphrase comes from the environment so the seed never touches
/// the command line or the config file.
fn load_identity(path: &Path) -> Result<NetworkIdentity> {
    let passphrase = std::env::var("SWARMVEIL_PASSPHRASE")
        .context("SWARMVEIL_PASSPHRASE must be set to unlock the identity key")?;

    if path.exists() {
        info!("loading identity from {}", path.display());
        return Ok(NetworkIdentity::load(path, &passphrase)?);
    }

    let identity = NetworkIdentity::generate();
    identity.save(path, &passphrase)?;
    info!(
        peer = %identity.peer_id().short(),
        "generated new identity at {}",
        path.display()
    );
    Ok(identity)
}
