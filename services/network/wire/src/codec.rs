//! Framing for peer messages.
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 magic            | network identifier         |
//! +----------------------+----------------------------+
//! | u32 payload_len      | length of bytes that follow|
//! +----------------------+----------------------------+
//! | payload              | CBOR encoded message       |
//! +----------------------+----------------------------+
//! ```

use crate::{Message, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 8;

/// Default payload limit (1 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Encoder and decoder for framed messages
#[derive(Debug, Clone)]
pub struct MessageCodec {
    magic: u32,
    max_payload: usize,
}

impl MessageCodec {
    /// Create a codec for the given network identifier
    pub fn new(magic: u32, max_payload: usize) -> Self {
        Self { magic, max_payload }
    }

    /// Network identifier carried by every frame
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Encode a message into a contiguous frame
    pub fn encode(&self, message: &Message) -> Result<Bytes, WireError> {
        let mut payload = Vec::new();
        ciborium::into_writer(message, &mut payload)
            .map_err(|e| WireError::Encode(e.to_string()))?;

        if payload.len() > self.max_payload {
            return Err(WireError::Size(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32(self.magic);
        buf.put_u32(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one message from a buffer, `None` until a full frame is buffered
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != self.magic {
            return Err(WireError::Magic(magic));
        }

        let payload_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if payload_len > self.max_payload {
            return Err(WireError::Size(payload_len));
        }

        if buf.len() < HEADER_SIZE + payload_len {
            trace!(
                "Partial frame: have {} of {} bytes",
                buf.len(),
                HEADER_SIZE + payload_len
            );
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        ciborium::from_reader(payload.as_ref())
            .map(Some)
            .map_err(|e| WireError::Decode(e.to_string()))
    }
}
