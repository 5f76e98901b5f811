//! Configuration handling for the node.
//!
//! Settings come from a YAML file, then `P2P_*` environment variables, then
//! command line flags, each layer overriding the one before.

use anyhow::Result;
use p2p_session::{Authority, Settings};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Network core settings
    pub network: Settings,
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    network: Option<Settings>,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("Loaded configuration from {:?}", path);
                }
                Err(e) => warn!("Failed to parse config file {:?} ({}), using defaults", path, e),
            },
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides();

        info!(
            "Network configuration: inbound_port={}, outbound_connections={}, peers={}, blacklists={}",
            config.network.inbound_port,
            config.network.outbound_connections,
            config.network.peers.len(),
            config.network.blacklists.len()
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        if let Some(network) = root.network {
            self.network = network;
        }
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `P2P_*` overrides from the given lookup
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("P2P_INBOUND_PORT").and_then(|v| v.parse().ok()) {
            self.network.inbound_port = port;
            info!("Inbound port overridden by environment: {}", port);
        }

        if let Some(count) = lookup("P2P_OUTBOUND_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.network.outbound_connections = count;
            info!("Outbound connections overridden by environment: {}", count);
        }

        if let Some(count) = lookup("P2P_INBOUND_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.network.inbound_connections = count;
            info!("Inbound connections overridden by environment: {}", count);
        }

        if let Some(peers) = lookup("P2P_PEERS") {
            self.network.peers = parse_authorities("P2P_PEERS", &peers);
        }

        if let Some(blacklists) = lookup("P2P_BLACKLISTS") {
            self.network.blacklists = parse_authorities("P2P_BLACKLISTS", &blacklists);
        }
    }
}

fn parse_authorities(key: &str, value: &str) -> Vec<Authority> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse() {
            Ok(authority) => Some(authority),
            Err(e) => {
                warn!("Ignoring invalid {} entry: {}", key, e);
                None
            }
        })
        .collect()
}
