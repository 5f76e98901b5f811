//! A live, identified peer connection.
//!
//! A channel wraps a [`Proxy`] with the peer's identity (nonce and negotiated
//! version), the notification policy and two timers: an absolute expiration
//! that is never renewed and an inactivity timeout renewed by every received
//! message. Timer fires, read failures and explicit stops all terminate the
//! channel through [`Channel::stop`].

use crate::authority::Authority;
use crate::deadline::{randomize, Deadline};
use crate::error::{Code, NetworkError};
use crate::proxy::{MessageReader, Proxy};
use crate::settings::Settings;
use crate::transport::IoStream;
use p2p_wire::{Message, VersionMessage};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Peer channel
pub struct Channel {
    proxy: Proxy,
    notify: AtomicBool,
    nonce: AtomicU64,
    peer_version: OnceLock<Arc<VersionMessage>>,
    expiration: Deadline,
    inactivity: Deadline,
}

impl Channel {
    /// Wrap a connected stream
    pub fn new(stream: IoStream, authority: Authority, settings: &Settings) -> Arc<Self> {
        Arc::new(Self {
            proxy: Proxy::new(stream, authority, settings),
            notify: AtomicBool::new(false),
            nonce: AtomicU64::new(0),
            peer_version: OnceLock::new(),
            expiration: Deadline::new(randomize(settings.channel_expiration())),
            inactivity: Deadline::new(randomize(settings.channel_inactivity())),
        })
    }

    // Start sequence.
    // ------------------------------------------------------------------------

    /// Start the transport, then the timers, then the read cycle
    ///
    /// The handler runs before the first message is read, so protocols
    /// subscribed from within it observe every message.
    pub fn start<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(Code),
    {
        trace!("Channel starting [{}]", self.authority());

        match self.proxy.start() {
            Ok(reader) => {
                self.do_start(handler);
                self.read_cycle(reader);
            }
            Err(e) => handler(Err(e)),
        }
    }

    // Don't start the timers until the socket is enabled.
    fn do_start<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(Code),
    {
        self.start_expiration();
        self.start_inactivity();
        handler(Ok(()));
    }

    fn read_cycle(self: &Arc<Self>, mut reader: MessageReader) {
        let channel = Arc::downgrade(self);
        let mut stopping = self.proxy.stopping();

        tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = stopping.wait_for(|stopped| *stopped) => break,
                    result = reader.read() => result,
                };

                let Some(channel) = channel.upgrade() else {
                    break;
                };

                match result {
                    Ok(Some(message)) => {
                        channel.signal_activity();
                        channel.proxy.relay(message);
                    }
                    Ok(None) => {
                        debug!("Peer closed channel [{}]", channel.authority());
                        channel.stop(Ok(()));
                        break;
                    }
                    Err(e) => {
                        channel.stop(Err(e));
                        break;
                    }
                }
            }
        });
    }

    // Properties.
    // ------------------------------------------------------------------------

    /// Remote endpoint
    pub fn authority(&self) -> Authority {
        self.proxy.authority()
    }

    /// Whether higher layers should announce this channel
    pub fn notify(&self) -> bool {
        self.notify.load(Ordering::Acquire)
    }

    /// Set the notification policy
    pub fn set_notify(&self, value: bool) {
        self.notify.store(value, Ordering::Release);
    }

    /// Channel nonce, zero until registration assigns one
    pub fn nonce(&self) -> u64 {
        self.nonce.load(Ordering::Acquire)
    }

    /// Set the channel nonce
    pub fn set_nonce(&self, value: u64) {
        self.nonce.store(value, Ordering::Release);
    }

    /// The peer's version message
    ///
    /// # Panics
    ///
    /// Reading the peer version before the handshake has set it is a
    /// programming error.
    pub fn peer_version(&self) -> Arc<VersionMessage> {
        self.peer_version
            .get()
            .cloned()
            .expect("Read peer version before set.")
    }

    /// Set the peer's version message, later writes are ignored
    pub fn set_peer_version(&self, value: VersionMessage) {
        if self.peer_version.set(Arc::new(value)).is_err() {
            warn!("Peer version already set [{}]", self.authority());
        }
    }

    /// Version negotiated with the peer
    pub fn negotiated_version(&self) -> u32 {
        self.proxy.negotiated_version()
    }

    /// Record the negotiated version
    pub fn set_negotiated_version(&self, value: u32) {
        self.proxy.set_negotiated_version(value);
    }

    // Messaging.
    // ------------------------------------------------------------------------

    /// Receive every message read after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.proxy.subscribe()
    }

    /// Send a message, a write failure stops the channel
    pub async fn send(&self, message: Message) -> Code {
        let result = self.proxy.send(&message).await;
        if let Err(e) = &result {
            if !e.is_stop() {
                debug!(
                    "Failure sending {} to [{}] {}",
                    message,
                    self.authority(),
                    e
                );
                self.stop(Err(e.clone()));
            }
        }

        result
    }

    // Stop sequence.
    // ------------------------------------------------------------------------

    /// Register for the code that terminates the channel
    pub fn subscribe_stop<F>(&self, handler: F)
    where
        F: FnOnce(Code) + Send + 'static,
    {
        self.proxy.subscribe_stop(handler);
    }

    /// Stop the channel, only the first call has any effect
    pub fn stop(&self, code: Code) {
        if !self.proxy.begin_stop() {
            return;
        }

        match &code {
            Ok(()) => debug!("Channel closed [{}]", self.authority()),
            Err(e) => debug!("Channel stopped [{}] {}", self.authority(), e),
        }

        self.handle_stopping();
        self.proxy.finish_stop(code);
    }

    /// True once stop has begun
    pub fn stopped(&self) -> bool {
        self.proxy.stopped()
    }

    /// Code the channel stopped with, once delivered
    pub fn stop_code(&self) -> Option<Code> {
        self.proxy.stop_code()
    }

    /// Resolve once stop has begun
    pub async fn wait_stopped(&self) {
        self.proxy.wait_stopped().await;
    }

    // It is possible that this may be called multiple times.
    /// Cancel both timers
    pub fn handle_stopping(&self) {
        self.expiration.stop();
        self.inactivity.stop();
    }

    fn stopped_by(&self, code: &Code) -> bool {
        self.stopped() || matches!(code, Err(e) if e.is_stop())
    }

    /// Record peer activity, renewing the inactivity timeout
    pub fn signal_activity(self: &Arc<Self>) {
        self.start_inactivity();
    }

    // Timers (these are inherent races, requiring stranding by stop only).
    // ------------------------------------------------------------------------

    fn start_expiration(self: &Arc<Self>) {
        if self.stopped() {
            return;
        }

        let channel = Arc::downgrade(self);
        self.expiration.start(move |code| {
            if let Some(channel) = channel.upgrade() {
                channel.handle_expiration(code);
            }
        });
    }

    fn handle_expiration(&self, code: Code) {
        if self.stopped_by(&code) {
            return;
        }

        debug!("Channel lifetime expired [{}]", self.authority());
        self.stop(Err(NetworkError::ChannelTimeout));
    }

    fn start_inactivity(self: &Arc<Self>) {
        if self.stopped() {
            return;
        }

        let channel = Arc::downgrade(self);
        self.inactivity.start(move |code| {
            if let Some(channel) = channel.upgrade() {
                channel.handle_inactivity(code);
            }
        });
    }

    fn handle_inactivity(&self, code: Code) {
        if self.stopped_by(&code) {
            return;
        }

        debug!("Channel inactivity timeout [{}]", self.authority());
        self.stop(Err(NetworkError::ChannelTimeout));
    }
}

#[cfg(test)]
impl Channel {
    /// Expiration and inactivity arm counts
    pub(crate) fn arm_counts(&self) -> (usize, usize) {
        (self.expiration.arm_count(), self.inactivity.arm_count())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("authority", &self.authority())
            .field("nonce", &self.nonce())
            .field("notify", &self.notify())
            .field("stopped", &self.stopped())
            .finish()
    }
}
