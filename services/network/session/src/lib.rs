//! Channels, sessions and peer registration for the p2p network.
//!
//! This crate takes a connected socket to a registered, monitored peer
//! channel. It covers channel identity and timers, version handshake
//! selection, the network registry contract, and the admission sequence that
//! ties them together with exactly-once completion handlers.
//!
//! ## Features
//!
//! - **Channels**: nonce, write-once peer version, expiration and inactivity timers
//! - **Handshake**: legacy or reject-aware variant chosen by negotiated version
//! - **Keepalive**: ping/pong with RTT measurement
//! - **Registry**: address pool, pending tables, deduplicating channel store
//! - **Sessions**: inbound, outbound and manual connection strategies
//!
//! ## Example
//!
//! ```rust,no_run
//! use p2p_session::{InboundSession, NetworkManager, OutboundSession, Settings};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), p2p_session::NetworkError> {
//! let settings = Arc::new(Settings::default());
//! let network = NetworkManager::new(settings.clone());
//!
//! let inbound = InboundSession::new(network.clone(), settings.clone());
//! inbound.start().await?;
//!
//! let outbound = OutboundSession::new(network.clone(), settings);
//! outbound.start()?;
//!
//! tokio::signal::ctrl_c().await.ok();
//! network.stop();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod authority;
pub mod channel;
pub mod connector;
pub mod deadline;
pub mod error;
pub mod network;
pub mod protocols;
pub mod proxy;
pub mod sessions;
pub mod settings;
pub mod subscriber;
pub mod transport;

#[cfg(test)]
mod test_util;

// Re-export main types
pub use acceptor::Acceptor;
pub use authority::{Authority, AuthorityError};
pub use channel::Channel;
pub use connector::Connector;
pub use deadline::{randomize, Deadline};
pub use error::{Code, NetworkError, ResultHandler};
pub use network::{Network, NetworkManager};
pub use protocols::Handshake;
pub use proxy::Proxy;
pub use sessions::{Direction, InboundSession, ManualSession, OutboundSession, Session};
pub use settings::Settings;
pub use subscriber::StopSubscriber;
pub use transport::{connect_tcp, listen_tcp, IoStream};
