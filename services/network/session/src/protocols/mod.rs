//! Message protocols attached to channels.

pub mod ping;
pub mod version;

pub use version::Handshake;
