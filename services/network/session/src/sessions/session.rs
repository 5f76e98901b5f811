//! Channel admission.
//!
//! A [`Session`] drives each channel it is handed from a connected socket to
//! a registered peer: assign identity, start the channel, attach the version
//! handshake, store the channel with the network, and wire the channel's stop
//! to its removal. Every registration completes both of its handlers exactly
//! once, whichever step fails.

use crate::acceptor::Acceptor;
use crate::authority::Authority;
use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::{Code, NetworkError};
use crate::network::Network;
use crate::protocols::Handshake;
use crate::settings::Settings;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Which side initiated the connections a session admits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Peer connected to us
    Inbound,
    /// We connected to the peer
    Outbound,
}

/// Admission sequence shared by the inbound, outbound and manual sessions
#[derive(Debug)]
pub struct Session {
    network: Arc<dyn Network>,
    settings: Arc<Settings>,
    notify_on_connect: bool,
    direction: Direction,
    stopped: AtomicBool,
}

impl Session {
    /// Create a session, stopped until started
    pub fn new(
        network: Arc<dyn Network>,
        settings: Arc<Settings>,
        notify_on_connect: bool,
        direction: Direction,
    ) -> Arc<Self> {
        Arc::new(Self {
            network,
            settings,
            notify_on_connect,
            direction,
            stopped: AtomicBool::new(true),
        })
    }

    // Start sequence.
    // ------------------------------------------------------------------------

    /// Start the session, `OperationFailed` if already running
    pub fn start<F>(self: &Arc<Self>, handler: F)
    where
        F: FnOnce(Code),
    {
        if !self.stopped.swap(false, Ordering::AcqRel) {
            handler(Err(NetworkError::OperationFailed));
            return;
        }

        // Subscribe before anything else so a concurrent stop is not missed.
        let session = Arc::downgrade(self);
        self.network.subscribe_stop(Box::new(move |code| {
            if let Some(session) = session.upgrade() {
                session.handle_stop(code);
            }
        }));

        if self.stopped() {
            handler(Err(NetworkError::ServiceStopped));
            return;
        }

        trace!("Session started ({:?})", self.direction);
        handler(Ok(()));
    }

    fn handle_stop(&self, code: Code) {
        self.stopped.store(true, Ordering::Release);
        debug!(
            "Session stopped ({:?}) {}",
            self.direction,
            code.err().map(|e| e.to_string()).unwrap_or_default()
        );
    }

    /// True until started and again once the network stops
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Connection direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Network settings
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    // Registration sequence.
    // ------------------------------------------------------------------------

    /// Admit a channel
    ///
    /// `handle_started` receives the admission result after every other step,
    /// exactly once. `handle_stopped` receives the same error when admission
    /// fails, otherwise the code that eventually terminates the channel. A
    /// stopped session completes both with `ServiceStopped` and leaves the
    /// channel untouched.
    pub fn register_channel<S, T>(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        handle_started: S,
        handle_stopped: T,
    ) where
        S: FnOnce(Code) + Send + 'static,
        T: FnOnce(Code) + Send + 'static,
    {
        if self.stopped() {
            handle_started(Err(NetworkError::ServiceStopped));
            handle_stopped(Err(NetworkError::ServiceStopped));
            return;
        }

        channel.set_notify(self.notify_on_connect);
        channel.set_nonce(rand::thread_rng().gen_range(1..=u64::MAX));

        if self.direction == Direction::Outbound {
            if let Err(e) = self.network.pend_channel(&channel) {
                self.handle_start(Err(e), &channel, handle_started, handle_stopped);
                return;
            }
        }

        let session = self.clone();
        let starting = channel.clone();
        self.start_channel(&channel, move |code| {
            session.handle_starting(code, starting, handle_started, handle_stopped);
        });
    }

    fn start_channel<F>(&self, channel: &Arc<Channel>, handler: F)
    where
        F: FnOnce(Code),
    {
        channel.start(handler);
    }

    fn handle_starting<S, T>(
        self: &Arc<Self>,
        code: Code,
        channel: Arc<Channel>,
        handle_started: S,
        handle_stopped: T,
    ) where
        S: FnOnce(Code) + Send + 'static,
        T: FnOnce(Code) + Send + 'static,
    {
        if let Err(e) = code {
            debug!("Failure starting channel [{}] {}", channel.authority(), e);
            self.handle_start(Err(e), &channel, handle_started, handle_stopped);
            return;
        }

        let session = self.clone();
        let handshaking = channel.clone();
        self.attach_handshake_protocols(&channel, move |code| {
            session.handle_handshake(code, handshaking, handle_started, handle_stopped);
        });
    }

    /// Attach the handshake variant for the channel's negotiated version
    pub fn attach_handshake_protocols<F>(&self, channel: &Arc<Channel>, handler: F) -> Handshake
    where
        F: FnOnce(Code) + Send + 'static,
    {
        let handshake = Handshake::for_version(channel.negotiated_version());
        handshake.attach_and_start(channel, self.settings.clone(), handler);
        handshake
    }

    fn handle_handshake<S, T>(
        self: &Arc<Self>,
        code: Code,
        channel: Arc<Channel>,
        handle_started: S,
        handle_stopped: T,
    ) where
        S: FnOnce(Code) + Send + 'static,
        T: FnOnce(Code) + Send + 'static,
    {
        let code = code.and_then(|()| self.handshake_complete(&channel));
        self.handle_start(code, &channel, handle_started, handle_stopped);
    }

    fn handshake_complete(&self, channel: &Arc<Channel>) -> Code {
        if channel.stopped() {
            return Err(NetworkError::ChannelStopped);
        }

        if self.direction == Direction::Inbound && self.network.pending(channel.peer_version().nonce) {
            debug!("Rejected connection to self [{}]", channel.authority());
            return Err(NetworkError::AcceptFailed("connection to self".to_string()));
        }

        self.network.store(channel)
    }

    fn handle_start<S, T>(
        self: &Arc<Self>,
        code: Code,
        channel: &Arc<Channel>,
        handle_started: S,
        handle_stopped: T,
    ) where
        S: FnOnce(Code) + Send + 'static,
        T: FnOnce(Code) + Send + 'static,
    {
        if self.direction == Direction::Outbound {
            self.network.unpend_channel(channel);
        }

        match code {
            Err(e) => {
                channel.stop(Err(e.clone()));
                handle_stopped(Err(e.clone()));
                handle_started(Err(e));
            }
            Ok(()) => {
                debug!("Registered channel [{}]", channel.authority());
                let network = self.network.clone();
                let stopping = Arc::downgrade(channel);
                channel.subscribe_stop(move |code| {
                    Self::handle_remove(network, stopping, code, handle_stopped);
                });
                handle_started(Ok(()));
            }
        }
    }

    fn handle_remove<T>(network: Arc<dyn Network>, channel: Weak<Channel>, code: Code, handle_stopped: T)
    where
        T: FnOnce(Code),
    {
        if let Some(channel) = channel.upgrade() {
            network.remove(&channel);
        }

        handle_stopped(code);
    }

    /// Register a channel and wait for the admission result
    ///
    /// The returned receiver resolves with the channel's stop code.
    pub async fn admit(
        self: &Arc<Self>,
        channel: Arc<Channel>,
    ) -> (Code, oneshot::Receiver<Code>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();

        self.register_channel(
            channel,
            move |code| {
                let _ = started_tx.send(code);
            },
            move |code| {
                let _ = stopped_tx.send(code);
            },
        );

        let started = started_rx
            .await
            .unwrap_or(Err(NetworkError::OperationCanceled));
        (started, stopped_rx)
    }

    // Network pass-throughs.
    // ------------------------------------------------------------------------

    /// Invoke the handler once when the node stops
    pub fn subscribe_stop<F>(&self, handler: F)
    where
        F: FnOnce(Code) + Send + 'static,
    {
        self.network.subscribe_stop(Box::new(handler));
    }

    /// Number of known peer addresses
    pub fn address_count(&self) -> usize {
        self.network.address_count()
    }

    /// Number of registered channels
    pub fn connection_count(&self) -> usize {
        self.network.connection_count()
    }

    /// A candidate peer address
    pub fn fetch_address(&self) -> Result<Authority, NetworkError> {
        self.network.fetch_address()
    }

    /// Reserve a slot for an in-flight connect
    pub fn pend_connector(&self, connector: &Arc<Connector>) -> Code {
        self.network.pend_connector(connector)
    }

    /// Release a connect reservation
    pub fn unpend_connector(&self, connector: &Arc<Connector>) {
        self.network.unpend_connector(connector);
    }

    /// Reserve a slot for an in-flight handshake
    pub fn pend_channel(&self, channel: &Arc<Channel>) -> Code {
        self.network.pend_channel(channel)
    }

    /// Release a handshake reservation
    pub fn unpend_channel(&self, channel: &Arc<Channel>) {
        self.network.unpend_channel(channel);
    }

    /// True if a handshake with this nonce is in flight
    pub fn pending(&self, nonce: u64) -> bool {
        self.network.pending(nonce)
    }

    // Utilities.
    // ------------------------------------------------------------------------

    /// True if the authority's address is configured as blocked, port ignored
    pub fn blacklisted(&self, authority: &Authority) -> bool {
        self.settings
            .blacklists
            .iter()
            .any(|blocked| blocked.ip() == authority.ip())
    }

    /// A new listener using this session's settings
    pub fn create_acceptor(&self) -> Arc<Acceptor> {
        Acceptor::new(self.settings.clone())
    }

    /// A new dialer using this session's settings
    pub fn create_connector(&self) -> Arc<Connector> {
        Connector::new(self.settings.clone())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug_assert!(self.stopped(), "The session was not stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkManager;
    use crate::test_util::{memory_channel, memory_channel_at, version_message, RemotePeer};
    use p2p_wire::{level, Message};

    fn settings() -> Arc<Settings> {
        Arc::new(Settings {
            blacklists: vec!["10.0.0.1".parse().unwrap()],
            ..Settings::default()
        })
    }

    fn running(direction: Direction) -> (Arc<NetworkManager>, Arc<Session>) {
        let settings = settings();
        let network = NetworkManager::new(settings.clone());
        let session = Session::new(network.clone(), settings, true, direction);

        let mut started = None;
        session.start(|code| started = Some(code));
        assert_eq!(started, Some(Ok(())));
        (network, session)
    }

    struct Outcome {
        started: oneshot::Receiver<Code>,
        stopped: oneshot::Receiver<Code>,
    }

    fn register(session: &Arc<Session>, channel: &Arc<Channel>) -> Outcome {
        let (started_tx, started) = oneshot::channel();
        let (stopped_tx, stopped) = oneshot::channel();
        session.register_channel(
            channel.clone(),
            move |code| {
                let _ = started_tx.send(code);
            },
            move |code| {
                let _ = stopped_tx.send(code);
            },
        );
        Outcome { started, stopped }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (network, session) = running(Direction::Inbound);

        let mut second = None;
        session.start(|code| second = Some(code));

        assert_eq!(second, Some(Err(NetworkError::OperationFailed)));
        assert!(!session.stopped());
        network.stop();
    }

    #[tokio::test]
    async fn test_network_stop_stops_session() {
        let (network, session) = running(Direction::Inbound);
        let notified = Arc::new(std::sync::Mutex::new(None));
        let recorded = notified.clone();
        session.subscribe_stop(move |code| *recorded.lock().unwrap() = Some(code));

        network.stop();

        assert!(session.stopped());
        assert_eq!(
            *notified.lock().unwrap(),
            Some(Err(NetworkError::ServiceStopped))
        );

        let mut restarted = None;
        session.start(|code| restarted = Some(code));
        assert_eq!(restarted, Some(Err(NetworkError::ServiceStopped)));
        assert!(session.stopped());
    }

    #[tokio::test]
    async fn test_stopped_session_short_circuits() {
        let (network, session) = running(Direction::Outbound);
        network.stop();
        let (channel, _remote) = memory_channel(&session.settings());

        let mut outcome = register(&session, &channel);

        assert_eq!(outcome.started.try_recv(), Ok(Err(NetworkError::ServiceStopped)));
        assert_eq!(outcome.stopped.try_recv(), Ok(Err(NetworkError::ServiceStopped)));
        assert_eq!(channel.nonce(), 0);
        assert!(!channel.stopped());
        assert_eq!(channel.arm_counts(), (0, 0));
        assert_eq!(network.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_start_completes_both_handlers() {
        let (network, session) = running(Direction::Inbound);
        let (channel, _remote) = memory_channel(&session.settings());
        channel.stop(Err(NetworkError::BadStream("reset".to_string())));

        let outcome = register(&session, &channel);

        let reset = Err(NetworkError::BadStream("reset".to_string()));
        assert_eq!(outcome.started.await, Ok(reset.clone()));
        assert_eq!(outcome.stopped.await, Ok(reset));
        assert!(channel.stopped());
        assert_eq!(channel.arm_counts(), (0, 0));
        assert_eq!(network.connection_count(), 0);
        network.stop();
    }

    #[tokio::test]
    async fn test_registration_success() {
        let (network, session) = running(Direction::Inbound);
        let (channel, stream) = memory_channel(&session.settings());
        let mut remote = RemotePeer::new(stream, &session.settings());

        let mut outcome = register(&session, &channel);
        let local = remote.handshake(version_message(level::BIP37, 5)).await;

        assert_eq!(outcome.started.await, Ok(Ok(())));
        assert_eq!(local.nonce, channel.nonce());
        assert_ne!(channel.nonce(), 0);
        assert!(channel.notify());
        assert_eq!(channel.negotiated_version(), level::BIP37);
        assert_eq!(network.connection_count(), 1);
        assert!(outcome.stopped.try_recv().is_err());

        channel.stop(Err(NetworkError::ChannelTimeout));

        assert_eq!(outcome.stopped.await, Ok(Err(NetworkError::ChannelTimeout)));
        assert_eq!(network.connection_count(), 0);
        network.stop();
    }

    #[tokio::test]
    async fn test_clean_close_reports_success() {
        let (network, session) = running(Direction::Inbound);
        let (channel, stream) = memory_channel(&session.settings());
        let mut remote = RemotePeer::new(stream, &session.settings());

        let outcome = register(&session, &channel);
        remote.handshake(version_message(level::BIP37, 5)).await;
        assert_eq!(outcome.started.await, Ok(Ok(())));

        drop(remote);

        assert_eq!(outcome.stopped.await, Ok(Ok(())));
        assert_eq!(network.connection_count(), 0);
        network.stop();
    }

    #[tokio::test]
    async fn test_duplicate_authority_rejected() {
        let (network, session) = running(Direction::Inbound);
        let authority: Authority = "10.0.0.9:8333".parse().unwrap();

        let (first, stream) = memory_channel_at(&session.settings(), authority);
        let mut first_remote = RemotePeer::new(stream, &session.settings());
        let first_outcome = register(&session, &first);
        first_remote.handshake(version_message(level::BIP37, 5)).await;
        assert_eq!(first_outcome.started.await, Ok(Ok(())));

        let (second, stream) = memory_channel_at(&session.settings(), authority);
        let mut second_remote = RemotePeer::new(stream, &session.settings());
        let second_outcome = register(&session, &second);
        second_remote.handshake(version_message(level::BIP37, 6)).await;

        assert_eq!(
            second_outcome.started.await,
            Ok(Err(NetworkError::AddressInUse))
        );
        assert_eq!(
            second_outcome.stopped.await,
            Ok(Err(NetworkError::AddressInUse))
        );
        assert!(second.stopped());
        assert!(!first.stopped());
        assert_eq!(network.connection_count(), 1);

        network.stop();
        assert_eq!(
            first_outcome.stopped.await,
            Ok(Err(NetworkError::ServiceStopped))
        );
        assert_eq!(network.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_failure_is_not_registered() {
        let (network, session) = running(Direction::Inbound);
        let (channel, stream) = memory_channel(&session.settings());
        let mut remote = RemotePeer::new(stream, &session.settings());

        let outcome = register(&session, &channel);
        remote.handshake(version_message(300, 5)).await;

        let expected = Err(NetworkError::PeerInsufficient {
            peer: 300,
            minimum: level::MINIMUM,
        });
        assert_eq!(outcome.started.await, Ok(expected.clone()));
        assert_eq!(outcome.stopped.await, Ok(expected.clone()));
        assert_eq!(channel.stop_code(), Some(expected));
        assert_eq!(network.connection_count(), 0);
        network.stop();
    }

    #[tokio::test]
    async fn test_inbound_connection_to_self_rejected() {
        let (network, session) = running(Direction::Inbound);
        let (ours, _ours_remote) = memory_channel_at(&session.settings(), "10.0.0.8:8333".parse().unwrap());
        ours.set_nonce(1234);
        network.pend_channel(&ours).unwrap();

        let (channel, stream) = memory_channel(&session.settings());
        let mut remote = RemotePeer::new(stream, &session.settings());
        let outcome = register(&session, &channel);
        remote.handshake(version_message(level::BIP37, 1234)).await;

        assert!(matches!(
            outcome.started.await,
            Ok(Err(NetworkError::AcceptFailed(_)))
        ));
        assert_eq!(network.connection_count(), 0);
        network.stop();
    }

    #[tokio::test]
    async fn test_outbound_registration_releases_pend() {
        let (network, session) = running(Direction::Outbound);
        let (channel, stream) = memory_channel(&session.settings());
        let mut remote = RemotePeer::new(stream, &session.settings());

        let outcome = register(&session, &channel);
        let local = remote.handshake(version_message(level::BIP61, 5)).await;
        let nonce = local.nonce;

        assert_eq!(outcome.started.await, Ok(Ok(())));
        assert!(!network.pending(nonce));
        assert_eq!(network.connection_count(), 1);
        network.stop();
    }

    #[tokio::test]
    async fn test_outbound_nonce_pending_until_complete() {
        let (network, session) = running(Direction::Outbound);
        let (channel, stream) = memory_channel(&session.settings());
        let mut remote = RemotePeer::new(stream, &session.settings());

        let outcome = register(&session, &channel);
        match remote.recv().await {
            Some(Message::Version(local)) => assert!(network.pending(local.nonce)),
            other => panic!("expected version, got {:?}", other),
        }

        channel.stop(Err(NetworkError::ChannelTimeout));
        assert_eq!(outcome.started.await, Ok(Err(NetworkError::ChannelStopped)));
        assert!(!network.pending(channel.nonce()));
        network.stop();
    }

    #[tokio::test]
    async fn test_handshake_variant_by_version() {
        let (network, session) = running(Direction::Inbound);

        for (version, expected) in [
            (level::MINIMUM, Handshake::Legacy),
            (level::BIP37, Handshake::Legacy),
            (level::BIP61, Handshake::RejectAware),
        ] {
            let (channel, _remote) = memory_channel(&session.settings());
            channel.set_negotiated_version(version);

            assert_eq!(session.attach_handshake_protocols(&channel, |_| {}), expected);
            channel.stop(Ok(()));
        }

        network.stop();
    }

    #[tokio::test]
    async fn test_blacklist_ignores_port() {
        let (network, session) = running(Direction::Inbound);

        assert!(session.blacklisted(&"10.0.0.1:8333".parse().unwrap()));
        assert!(session.blacklisted(&"10.0.0.1".parse().unwrap()));
        assert!(!session.blacklisted(&"10.0.0.2:8333".parse().unwrap()));
        network.stop();
    }

    #[tokio::test]
    async fn test_pass_throughs() {
        let (network, session) = running(Direction::Outbound);
        network.store_address("10.0.0.3:8333".parse().unwrap());

        assert_eq!(session.address_count(), 1);
        assert_eq!(session.fetch_address(), Ok("10.0.0.3:8333".parse().unwrap()));
        assert_eq!(session.connection_count(), 0);

        let connector = session.create_connector();
        assert_ne!(connector.id(), session.create_connector().id());
        assert_eq!(session.pend_connector(&connector), Ok(()));
        session.unpend_connector(&connector);

        let (channel, _remote) = memory_channel(&session.settings());
        channel.set_nonce(9);
        assert_eq!(session.pend_channel(&channel), Ok(()));
        assert!(session.pending(9));
        session.unpend_channel(&channel);
        assert!(!session.pending(9));

        assert!(session.create_acceptor().local_addr().is_none());
        network.stop();
    }
}
