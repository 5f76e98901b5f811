//! Peer message set and framing for the p2p network.
//!
//! This crate provides the low-level message layer that channels speak:
//! the handshake and keepalive messages, and a length-prefixed frame codec
//! carrying CBOR payloads.
//!
//! ## Features
//!
//! - **Handshake Messages**: `version`, `verack` and bip61 `reject`
//! - **Keepalive Messages**: `ping`/`pong` with echoed nonces
//! - **Framing**: network magic, bounded payload length, CBOR body
//! - **Zero-Copy Decoding**: Uses `Bytes`/`BytesMut` for buffered reads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;

// Re-export main types
pub use codec::{MessageCodec, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::WireError;
pub use message::{level, Message, RejectCode, RejectMessage, VersionMessage};
