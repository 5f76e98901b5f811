//! Accepts peer connections on the configured port.

use super::session::{Direction, Session};
use crate::acceptor::Acceptor;
use crate::channel::Channel;
use crate::error::{Code, NetworkError};
use crate::network::Network;
use crate::protocols::ping;
use crate::settings::Settings;
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Inbound connection session
#[derive(Debug)]
pub struct InboundSession {
    session: Arc<Session>,
    local_addr: OnceLock<SocketAddr>,
}

impl InboundSession {
    /// Create an unstarted inbound session
    pub fn new(network: Arc<dyn Network>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(network, settings, true, Direction::Inbound),
            local_addr: OnceLock::new(),
        })
    }

    /// Underlying admission session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Start listening on the configured port, a no-op when inbound is disabled
    pub async fn start(self: &Arc<Self>) -> Code {
        let settings = self.session.settings();
        if settings.inbound_port == 0 || settings.inbound_connections == 0 {
            self.start_session()?;
            info!("Not configured for inbound connections.");
            return Ok(());
        }

        let port = settings.inbound_port;
        self.start_on(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))
            .await
    }

    /// Start listening on a specific address
    pub async fn start_on(self: &Arc<Self>, addr: SocketAddr) -> Code {
        self.start_session()?;

        let acceptor = self.session.create_acceptor();
        acceptor.listen_on(addr).await?;
        if let Some(local) = acceptor.local_addr() {
            let _ = self.local_addr.set(local);
        }

        let stopping = acceptor.clone();
        self.session.subscribe_stop(move |_| stopping.stop());

        tokio::spawn(self.clone().accept_loop(acceptor));
        Ok(())
    }

    fn start_session(&self) -> Code {
        let mut result = Ok(());
        self.session.start(|code| result = code);
        result
    }

    /// Bound listening address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    async fn accept_loop(self: Arc<Self>, acceptor: Arc<Acceptor>) {
        loop {
            match acceptor.accept().await {
                Ok(channel) => self.handle_accept(channel),
                Err(NetworkError::ServiceStopped) => break,
                Err(e) => {
                    warn!("Failure accepting connection: {}", e);
                    if self.session.stopped() {
                        break;
                    }
                }
            }
        }

        debug!("Inbound accept loop exited");
    }

    fn handle_accept(&self, channel: Arc<Channel>) {
        let authority = channel.authority();

        if self.session.blacklisted(&authority) {
            debug!("Dropping blacklisted connection [{}]", authority);
            channel.stop(Err(NetworkError::AddressBlocked));
            return;
        }

        let limit = self.session.settings().inbound_connections;
        if self.session.connection_count() >= limit {
            debug!(
                "Dropping oversubscribed connection [{}] ({} connections)",
                authority, limit
            );
            channel.stop(Err(NetworkError::Oversubscribed));
            return;
        }

        let heartbeat = self.session.settings().channel_heartbeat();
        let started = channel.clone();
        self.session.register_channel(
            channel,
            move |code| match code {
                Ok(()) => {
                    info!("Connected inbound channel [{}]", started.authority());
                    ping::attach(&started, heartbeat);
                }
                Err(e) => debug!("Failure starting inbound channel [{}] {}", authority, e),
            },
            move |code| {
                debug!(
                    "Inbound channel stopped [{}] {}",
                    authority,
                    code.err().map(|e| e.to_string()).unwrap_or_default()
                );
            },
        );
    }
}
