//! P2P network node binary.
//!
//! Accepts inbound peers, maintains outbound and manual connections, and
//! shuts the network down cleanly on SIGINT or SIGTERM.

use clap::Parser;
use p2p_session::{Authority, InboundSession, ManualSession, NetworkManager, OutboundSession};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::NodeLogFormatter;

/// P2P network node
#[derive(Parser, Debug)]
#[command(name = "p2p-node", version, about = "Peer-to-peer network node")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), falls back to P2P_LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    /// Listening port, 0 disables inbound connections
    #[arg(long)]
    inbound_port: Option<u16>,

    /// Number of outbound connections to maintain
    #[arg(long)]
    outbound_connections: Option<usize>,

    /// Peer to keep a manual connection to, e.g. 10.0.0.5:8333 (repeatable)
    #[arg(long)]
    peer: Vec<Authority>,

    /// Address to refuse, port ignored (repeatable)
    #[arg(long)]
    blacklist: Vec<Authority>,

    /// Handshake timeout, e.g. 30s
    #[arg(long)]
    handshake_timeout: Option<humantime::Duration>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = args
        .log_level
        .clone()
        .or_else(|| std::env::var("P2P_LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("p2p_node={}", log_level).parse()?)
        .add_directive(format!("p2p_session={}", log_level).parse()?)
        .add_directive(format!("p2p_wire={}", log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(NodeLogFormatter::new("p2p-node"))
        .init();

    info!("Starting p2p node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::load_from_file(&args.config)?;

    let mut settings = config.network;
    if let Some(port) = args.inbound_port {
        settings.inbound_port = port;
    }
    if let Some(count) = args.outbound_connections {
        settings.outbound_connections = count;
    }
    if let Some(timeout) = args.handshake_timeout {
        settings.channel_handshake_seconds = timeout.as_secs().max(1);
    }
    settings.peers.extend(args.peer);
    settings.blacklists.extend(args.blacklist);
    let settings = Arc::new(settings);

    let network = NetworkManager::new(settings.clone());

    let inbound = InboundSession::new(network.clone(), settings.clone());
    let outbound = OutboundSession::new(network.clone(), settings.clone());
    let manual = ManualSession::new(network.clone(), settings.clone());

    if let Err(e) = start(&inbound, &outbound, &manual).await {
        network.stop();
        return Err(e);
    }

    for peer in &settings.peers {
        info!("Maintaining manual connection to [{}]", peer);
        manual.connect(*peer);
    }

    info!("Node started. Waiting for shutdown signal...");
    wait_for_shutdown().await?;

    info!("Shutting down...");
    network.stop();
    info!("Node stopped ({} connections remain)", network.channels().len());
    Ok(())
}

async fn start(
    inbound: &Arc<InboundSession>,
    outbound: &Arc<OutboundSession>,
    manual: &Arc<ManualSession>,
) -> anyhow::Result<()> {
    inbound.start().await?;
    outbound.start()?;
    manual.start()?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_repeatable_peers() {
        let args = Args::parse_from([
            "p2p-node",
            "--peer",
            "10.0.0.5:8333",
            "--peer",
            "[::1]:8333",
            "--blacklist",
            "10.0.0.1",
            "--handshake-timeout",
            "15s",
        ]);

        assert_eq!(args.peer.len(), 2);
        assert_eq!(args.blacklist[0].to_string(), "10.0.0.1");
        assert_eq!(args.handshake_timeout.map(|d| d.as_secs()), Some(15));
        assert_eq!(args.config, PathBuf::from("config.yaml"));
    }
}
