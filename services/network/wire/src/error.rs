//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Frame carries another network's identifier
    #[error("network magic mismatch: {0:#010x}")]
    Magic(u32),

    /// Payload size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Message could not be serialized
    #[error("message encoding failed: {0}")]
    Encode(String),

    /// Payload is not a valid message
    #[error("message decoding failed: {0}")]
    Decode(String),
}
