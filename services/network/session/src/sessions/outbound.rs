//! Maintains a fixed number of connections to pool addresses.

use super::session::{Direction, Session};
use super::{connect, next_backoff, pause, stop_watch, INITIAL_BACKOFF};
use crate::error::{Code, NetworkError};
use crate::network::Network;
use crate::settings::Settings;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

/// Outbound connection session
#[derive(Debug)]
pub struct OutboundSession {
    session: Arc<Session>,
}

impl OutboundSession {
    /// Create an unstarted outbound session
    pub fn new(network: Arc<dyn Network>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(network, settings, true, Direction::Outbound),
        })
    }

    /// Underlying admission session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Start one connection slot per configured outbound connection
    pub fn start(self: &Arc<Self>) -> Code {
        let mut result = Ok(());
        self.session.start(|code| result = code);
        result?;

        let slots = self.session.settings().outbound_connections;
        if slots == 0 {
            info!("Not configured for outbound connections.");
            return Ok(());
        }

        for slot in 0..slots {
            let stopping = stop_watch(&self.session);
            tokio::spawn(self.clone().run_slot(slot, stopping));
        }

        Ok(())
    }

    async fn run_slot(self: Arc<Self>, slot: usize, mut stopping: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;

        while !self.session.stopped() {
            match self.connect_once().await {
                Ok(stopped) => {
                    backoff = INITIAL_BACKOFF;
                    let code = stopped.await.unwrap_or(Err(NetworkError::OperationCanceled));
                    debug!(
                        "Outbound slot {} channel stopped {}",
                        slot,
                        code.err().map(|e| e.to_string()).unwrap_or_default()
                    );
                }
                Err(e) if e.is_stop() => break,
                Err(e) => {
                    debug!(
                        "Outbound slot {} failed: {}; retrying in {:?}",
                        slot, e, backoff
                    );
                    if !pause(&mut stopping, backoff).await {
                        break;
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }

        debug!("Outbound slot {} exited", slot);
    }

    async fn connect_once(&self) -> Result<oneshot::Receiver<Code>, NetworkError> {
        let authority = self.session.fetch_address()?;
        if self.session.blacklisted(&authority) {
            return Err(NetworkError::AddressBlocked);
        }

        let (channel, stopped) = connect(&self.session, authority).await?;
        info!("Connected outbound channel [{}]", channel.authority());
        Ok(stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::Authority;
    use crate::network::NetworkManager;
    use crate::test_util::{eventually, version_message, RemotePeer};
    use p2p_wire::{level, Message};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn outbound(settings: Settings) -> (Arc<NetworkManager>, Arc<OutboundSession>) {
        let settings = Arc::new(settings);
        let network = NetworkManager::new(settings.clone());
        let session = OutboundSession::new(network.clone(), settings);
        (network, session)
    }

    #[tokio::test]
    async fn test_connects_to_pool_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            outbound_connections: 1,
            hosts: vec![Authority::from(listener.local_addr().unwrap())],
            ..Settings::default()
        };
        let (network, session) = outbound(settings.clone());

        session.start().unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut remote = RemotePeer::tcp(stream, &settings);
        let local = remote.handshake(version_message(level::BIP61, 5)).await;

        assert_ne!(local.nonce, 0);
        assert_eq!(remote.recv().await, Some(Message::Verack));
        eventually(|| network.connection_count() == 1).await;
        assert!(!network.pending(local.nonce));

        network.stop();
        eventually(|| network.connection_count() == 0).await;
    }

    #[tokio::test]
    async fn test_blacklisted_address_not_dialed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = Settings {
            outbound_connections: 1,
            hosts: vec![Authority::from(listener.local_addr().unwrap())],
            blacklists: vec!["127.0.0.1".parse().unwrap()],
            ..Settings::default()
        };
        let (network, session) = outbound(settings);

        session.start().unwrap();

        let accepted = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(accepted.is_err());
        network.stop();
    }

    #[tokio::test]
    async fn test_disabled_without_slots() {
        let (network, session) = outbound(Settings {
            outbound_connections: 0,
            ..Settings::default()
        });

        assert_eq!(session.start(), Ok(()));
        assert_eq!(session.start(), Err(NetworkError::OperationFailed));
        network.stop();
        assert!(session.session().stopped());
    }
}
