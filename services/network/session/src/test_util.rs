//! Loopback channels and a scripted remote peer for unit tests.

use crate::authority::Authority;
use crate::channel::Channel;
use crate::settings::Settings;
use crate::transport::IoStream;
use bytes::BytesMut;
use p2p_wire::{Message, MessageCodec, VersionMessage};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

const PIPE_CAPACITY: usize = 64 * 1024;

/// A channel over an in-process pipe at a fixed loopback authority
pub fn memory_channel(settings: &Settings) -> (Arc<Channel>, DuplexStream) {
    memory_channel_at(settings, "127.0.0.1:8333".parse().unwrap())
}

/// A channel over an in-process pipe at the given authority
pub fn memory_channel_at(
    settings: &Settings,
    authority: Authority,
) -> (Arc<Channel>, DuplexStream) {
    let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
    let channel = Channel::new(IoStream::Memory(local), authority, settings);
    (channel, remote)
}

/// A minimal version message
pub fn version_message(value: u32, nonce: u64) -> VersionMessage {
    VersionMessage {
        value,
        services: 0,
        timestamp: 0,
        address_receiver: None,
        address_sender: None,
        nonce,
        user_agent: "/remote:0.0.0/".to_string(),
    }
}

/// Far end of a memory channel, speaking the framed protocol
pub struct RemotePeer {
    stream: IoStream,
    codec: MessageCodec,
    buffer: BytesMut,
}

impl RemotePeer {
    pub fn new(stream: DuplexStream, settings: &Settings) -> Self {
        Self::over(IoStream::Memory(stream), settings)
    }

    pub fn tcp(stream: TcpStream, settings: &Settings) -> Self {
        Self::over(IoStream::Plain(stream), settings)
    }

    fn over(stream: IoStream, settings: &Settings) -> Self {
        Self {
            stream,
            codec: MessageCodec::new(settings.identifier, settings.max_payload),
            buffer: BytesMut::new(),
        }
    }

    pub async fn send(&mut self, message: &Message) {
        let frame = self.codec.encode(message).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    /// Next message, `None` once the local side has closed
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer).unwrap() {
                return Some(message);
            }

            match self.stream.read_buf(&mut self.buffer).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Expect the local version, answer with ours and a verack
    pub async fn handshake(&mut self, version: VersionMessage) -> VersionMessage {
        let local = match self.recv().await {
            Some(Message::Version(local)) => local,
            other => panic!("expected version, got {:?}", other),
        };

        self.send(&Message::Version(version)).await;
        self.send(&Message::Verack).await;
        local
    }

    /// Read until a message matching the predicate arrives
    pub async fn recv_until<F>(&mut self, predicate: F) -> Option<Message>
    where
        F: Fn(&Message) -> bool,
    {
        while let Some(message) = self.recv().await {
            if predicate(&message) {
                return Some(message);
            }
        }
        None
    }
}

/// Poll until the condition holds, panicking after five seconds
pub async fn eventually<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
