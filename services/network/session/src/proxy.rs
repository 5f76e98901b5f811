//! Transport proxy: framed message I/O over a stream plus stop state.
//!
//! The proxy owns the socket halves and the stop subscription. It does not
//! drive its own read cycle; the owning channel takes the reader on start so
//! that every received message and every read failure route through the
//! channel's single stop path.

use crate::authority::Authority;
use crate::error::{Code, NetworkError};
use crate::settings::Settings;
use crate::subscriber::StopSubscriber;
use crate::transport::IoStream;
use bytes::BytesMut;
use p2p_wire::{Message, MessageCodec};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

/// Capacity of the per-channel message broadcast
const MESSAGE_BUFFER: usize = 64;

/// Reader half of a proxy, handed to the channel's read cycle
pub struct MessageReader {
    half: ReadHalf<IoStream>,
    buffer: BytesMut,
    codec: MessageCodec,
}

impl MessageReader {
    /// Read the next message, `None` on a clean end of stream
    pub async fn read(&mut self) -> Result<Option<Message>, NetworkError> {
        loop {
            if let Some(message) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(message));
            }

            let bytes_read = self.half.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                return Ok(None);
            }

            trace!(
                "Read {} bytes, buffer now has {} bytes",
                bytes_read,
                self.buffer.len()
            );
        }
    }
}

/// Framed message transport for one peer connection
pub struct Proxy {
    authority: Authority,
    codec: MessageCodec,
    negotiated_version: AtomicU32,
    reader: Mutex<Option<MessageReader>>,
    writer: tokio::sync::Mutex<WriteHalf<IoStream>>,
    messages: broadcast::Sender<Message>,
    stopped: AtomicBool,
    stopping: watch::Sender<bool>,
    stop_subscriber: StopSubscriber,
}

impl Proxy {
    /// Wrap a connected stream
    pub fn new(stream: IoStream, authority: Authority, settings: &Settings) -> Self {
        let codec = MessageCodec::new(settings.identifier, settings.max_payload);
        let (read_half, write_half) = tokio::io::split(stream);
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        let (stopping, _) = watch::channel(false);

        Self {
            authority,
            negotiated_version: AtomicU32::new(settings.protocol_maximum),
            reader: Mutex::new(Some(MessageReader {
                half: read_half,
                buffer: BytesMut::with_capacity(64 * 1024),
                codec: codec.clone(),
            })),
            writer: tokio::sync::Mutex::new(write_half),
            codec,
            messages,
            stopped: AtomicBool::new(false),
            stopping,
            stop_subscriber: StopSubscriber::new(),
        }
    }

    /// Remote endpoint
    pub fn authority(&self) -> Authority {
        self.authority
    }

    /// Version negotiated with the peer, the configured maximum until handshake
    pub fn negotiated_version(&self) -> u32 {
        self.negotiated_version.load(Ordering::Acquire)
    }

    /// Record the negotiated version
    pub fn set_negotiated_version(&self, value: u32) {
        self.negotiated_version.store(value, Ordering::Release);
    }

    /// Hand out the reader, exactly once and only before stop
    ///
    /// A stopped proxy reports the error it stopped with, or `ChannelStopped`
    /// after a clean stop.
    pub(crate) fn start(&self) -> Result<MessageReader, NetworkError> {
        if self.stopped() {
            return Err(match self.stop_code() {
                Some(Err(e)) => e,
                _ => NetworkError::ChannelStopped,
            });
        }

        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(NetworkError::OperationFailed)
    }

    /// Receive every message read after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.messages.subscribe()
    }

    /// Fan a received message out to subscribed protocols
    pub(crate) fn relay(&self, message: Message) {
        trace!("Received {} from [{}]", message, self.authority);
        // No subscribers is not an error, the message is simply unhandled.
        let _ = self.messages.send(message);
    }

    /// Frame and write a message
    pub async fn send(&self, message: &Message) -> Code {
        if self.stopped() {
            return Err(NetworkError::ChannelStopped);
        }

        let frame = self.codec.encode(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;

        trace!("Sent {} to [{}] ({} bytes)", message, self.authority, frame.len());
        Ok(())
    }

    /// Register for the terminal stop code
    pub fn subscribe_stop<F>(&self, handler: F)
    where
        F: FnOnce(Code) + Send + 'static,
    {
        self.stop_subscriber.subscribe(handler);
    }

    /// Mark stopped, returns false if another caller got there first
    pub(crate) fn begin_stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    /// Deliver the stop code to subscribers, then wake I/O loops
    pub(crate) fn finish_stop(&self, code: Code) {
        if self.stop_subscriber.relay(code) {
            debug!("Proxy stopped [{}]", self.authority);
        }
        self.stopping.send_replace(true);
    }

    /// True once stop has begun
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Code the proxy stopped with, once relayed
    pub fn stop_code(&self) -> Option<Code> {
        self.stop_subscriber.code()
    }

    /// Watch that flips to true once stop has begun
    pub(crate) fn stopping(&self) -> watch::Receiver<bool> {
        self.stopping.subscribe()
    }

    /// Resolve once stop has begun
    pub async fn wait_stopped(&self) {
        let mut stopping = self.stopping();
        // The sender lives as long as the proxy, so an error cannot occur here.
        let _ = stopping.wait_for(|stopped| *stopped).await;
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("authority", &self.authority)
            .field("negotiated_version", &self.negotiated_version())
            .field("stopped", &self.stopped())
            .finish()
    }
}
