//! Peer network endpoint identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

/// Authority parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid authority: {0}")]
pub struct AuthorityError(String);

/// An IP address and port, port zero meaning unspecified
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Authority {
    ip: IpAddr,
    port: u16,
}

impl Authority {
    /// Create an authority, IPv4-mapped IPv6 addresses are stored as IPv4
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip: ip.to_canonical(),
            port,
        }
    }

    /// IP address
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Port, zero if unspecified
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Socket address for dialing
    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for Authority {
    type Err = AuthorityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }

        // Bare address, possibly bracketed IPv6
        let bare = s
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(s);

        bare.parse::<IpAddr>()
            .map(|ip| Self::new(ip, 0))
            .map_err(|_| AuthorityError(s.to_string()))
    }
}

impl TryFrom<String> for Authority {
    type Error = AuthorityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Authority> for String {
    fn from(authority: Authority) -> Self {
        authority.to_string()
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip, self.port) {
            (ip, 0) => write!(f, "{}", ip),
            (IpAddr::V4(ip), port) => write!(f, "{}:{}", ip, port),
            (IpAddr::V6(ip), port) => write!(f, "[{}]:{}", ip, port),
        }
    }
}
