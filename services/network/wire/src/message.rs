//! Peer messages exchanged over a channel.
//!
//! Only the messages the connection lifecycle needs are modelled here: the
//! version handshake (`version`/`verack`), `reject` for peers speaking bip61
//! and above, and `ping`/`pong` keepalive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Protocol version levels that gate message support.
pub mod level {
    /// Lowest version this node will negotiate with
    pub const MINIMUM: u32 = 31402;
    /// `pong` message support
    pub const BIP31: u32 = 60001;
    /// Connection bloom filtering
    pub const BIP37: u32 = 70001;
    /// `reject` message support
    pub const BIP61: u32 = 70002;
    /// Highest version this node advertises
    pub const MAXIMUM: u32 = 70013;
}

/// A message on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Version announcement, first message on every channel
    Version(VersionMessage),
    /// Acknowledges a received version
    Verack,
    /// Rejection of a previously received message
    Reject(RejectMessage),
    /// Keepalive request
    Ping {
        /// Echoed back in the pong
        nonce: u64,
    },
    /// Keepalive response
    Pong {
        /// Nonce of the ping being answered
        nonce: u64,
    },
}

impl Message {
    /// Command name of the message
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Reject(_) => "reject",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// Payload of a `version` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMessage {
    /// Highest protocol version supported by the sender
    pub value: u32,
    /// Service bits advertised by the sender
    pub services: u64,
    /// Sender's clock, unix seconds
    pub timestamp: i64,
    /// Address of the receiving peer as seen by the sender
    pub address_receiver: Option<SocketAddr>,
    /// Sender's own advertised address
    pub address_sender: Option<SocketAddr>,
    /// Random per-channel nonce, used to detect connections to self
    pub nonce: u64,
    /// Free-form client identification
    pub user_agent: String,
}

/// Reject reason codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    /// Message could not be decoded
    Malformed = 0x01,
    /// Message is invalid
    Invalid = 0x10,
    /// Sender's protocol version is too old
    Obsolete = 0x11,
    /// Message duplicates an earlier one
    Duplicate = 0x12,
    /// Non-standard content
    Nonstandard = 0x40,
    /// Output below dust threshold
    Dust = 0x41,
    /// Fee too low
    InsufficientFee = 0x42,
    /// Conflicts with a checkpoint
    Checkpoint = 0x43,
}

/// Payload of a `reject` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectMessage {
    /// Command of the rejected message
    pub message: String,
    /// Reason code
    pub code: RejectCode,
    /// Human readable reason
    pub reason: String,
}

impl RejectMessage {
    /// Reject a peer's version as too old
    pub fn obsolete_version(reason: impl Into<String>) -> Self {
        Self {
            message: "version".to_string(),
            code: RejectCode::Obsolete,
            reason: reason.into(),
        }
    }
}
