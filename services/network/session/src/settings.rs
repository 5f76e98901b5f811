//! Network settings shared by sessions, channels and protocols.

use crate::authority::Authority;
use p2p_wire::{level, DEFAULT_MAX_PAYLOAD};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the network core
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Highest protocol version advertised, also the initial negotiated version
    pub protocol_maximum: u32,
    /// Lowest protocol version accepted from peers
    pub protocol_minimum: u32,
    /// Service bits advertised in our version message
    pub services: u64,
    /// Network identifier (frame magic)
    pub identifier: u32,
    /// Listening port, 0 disables inbound connections
    pub inbound_port: u16,
    /// Connection count above which inbound peers are refused
    pub inbound_connections: usize,
    /// Number of outbound connections to maintain
    pub outbound_connections: usize,
    /// Attempts per manual connection, 0 is unlimited
    pub manual_attempt_limit: u32,
    /// Timeout for outbound connect attempts (seconds)
    pub connect_timeout_seconds: u64,
    /// Timeout for the version handshake (seconds)
    pub channel_handshake_seconds: u64,
    /// Interval between keepalive pings (minutes)
    pub channel_heartbeat_minutes: u64,
    /// Idle time before a channel is dropped (minutes)
    pub channel_inactivity_minutes: u64,
    /// Absolute channel lifetime (minutes)
    pub channel_expiration_minutes: u64,
    /// Maximum number of addresses in the host pool
    pub host_pool_capacity: usize,
    /// Maximum message payload in bytes
    pub max_payload: usize,
    /// User agent advertised in our version message
    pub user_agent: String,
    /// Our own advertised address, if known
    pub self_address: Option<Authority>,
    /// Peers refused by IP address (port ignored)
    pub blacklists: Vec<Authority>,
    /// Initial contents of the host pool
    pub hosts: Vec<Authority>,
    /// Peers to maintain manual connections to
    pub peers: Vec<Authority>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            protocol_maximum: level::MAXIMUM,
            protocol_minimum: level::MINIMUM,
            services: 0,
            identifier: 0xd9b4_bef9,
            inbound_port: 8333,
            inbound_connections: 32,
            outbound_connections: 8,
            manual_attempt_limit: 0,
            connect_timeout_seconds: 5,
            channel_handshake_seconds: 30,
            channel_heartbeat_minutes: 5,
            channel_inactivity_minutes: 10,
            channel_expiration_minutes: 60,
            host_pool_capacity: 1000,
            max_payload: DEFAULT_MAX_PAYLOAD,
            user_agent: concat!("/p2p:", env!("CARGO_PKG_VERSION"), "/").to_string(),
            self_address: None,
            blacklists: Vec::new(),
            hosts: Vec::new(),
            peers: Vec::new(),
        }
    }
}

impl Settings {
    /// Outbound connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Version handshake timeout
    pub fn channel_handshake(&self) -> Duration {
        Duration::from_secs(self.channel_handshake_seconds)
    }

    /// Keepalive ping interval
    pub fn channel_heartbeat(&self) -> Duration {
        Duration::from_secs(self.channel_heartbeat_minutes * 60)
    }

    /// Inactivity timeout
    pub fn channel_inactivity(&self) -> Duration {
        Duration::from_secs(self.channel_inactivity_minutes * 60)
    }

    /// Channel lifetime
    pub fn channel_expiration(&self) -> Duration {
        Duration::from_secs(self.channel_expiration_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.protocol_maximum, level::MAXIMUM);
        assert_eq!(settings.protocol_minimum, level::MINIMUM);
        assert_eq!(settings.channel_inactivity(), Duration::from_secs(600));
        assert_eq!(settings.channel_expiration(), Duration::from_secs(3600));
        assert!(settings.blacklists.is_empty());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
inbound_port: 18333
blacklists:
  - "10.0.0.1"
  - "[2001:db8::1]:8333"
"#;
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.inbound_port, 18333);
        assert_eq!(settings.outbound_connections, 8);
        assert_eq!(settings.blacklists.len(), 2);
        assert_eq!(settings.blacklists[0].to_string(), "10.0.0.1");
    }

    #[test]
    fn test_invalid_authority_rejected() {
        let yaml = "peers: [\"nowhere\"]";
        assert!(serde_yaml::from_str::<Settings>(yaml).is_err());
    }
}
