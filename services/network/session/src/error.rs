//! Result codes delivered to completion handlers.

use p2p_wire::WireError;
use thiserror::Error;

/// Network errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Session or network is not accepting new work
    #[error("service stopped")]
    ServiceStopped,

    /// Start attempted while already running
    #[error("operation failed")]
    OperationFailed,

    /// Pending timer or connect attempt was canceled
    #[error("operation canceled")]
    OperationCanceled,

    /// Channel has been stopped
    #[error("channel stopped")]
    ChannelStopped,

    /// Expiration, inactivity, handshake or connect timer fired
    #[error("channel timed out")]
    ChannelTimeout,

    /// Authority or nonce already registered
    #[error("address in use")]
    AddressInUse,

    /// Address pool has no candidate
    #[error("address not found")]
    AddressNotFound,

    /// Authority matches a blacklist entry
    #[error("address blocked")]
    AddressBlocked,

    /// Connection limit reached
    #[error("too many connections")]
    Oversubscribed,

    /// Socket read or write failed
    #[error("bad stream: {0}")]
    BadStream(String),

    /// Outbound connection attempt failed
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Inbound connection refused or listener failure
    #[error("accept failed: {0}")]
    AcceptFailed(String),

    /// Peer speaks a protocol version below the configured minimum
    #[error("peer version {peer} below minimum {minimum}")]
    PeerInsufficient {
        /// Version announced by the peer
        peer: u32,
        /// Configured minimum
        minimum: u32,
    },

    /// Handshake protocol violation or rejection
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Frame could not be encoded or decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl NetworkError {
    /// True for codes that report a stop or cancellation rather than a fault
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            NetworkError::ChannelStopped
                | NetworkError::ServiceStopped
                | NetworkError::OperationCanceled
        )
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::BadStream(e.to_string())
    }
}

/// Completion code, `Ok(())` is success
pub type Code = Result<(), NetworkError>;

/// Completion handler invoked exactly once with a result code
pub type ResultHandler = Box<dyn FnOnce(Code) + Send + 'static>;
