//! Inbound socket factory.

use crate::authority::Authority;
use crate::channel::Channel;
use crate::error::{Code, NetworkError};
use crate::settings::Settings;
use crate::transport::{listen_tcp, IoStream};
use std::net::{Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Listens for and accepts peer connections
#[derive(Debug)]
pub struct Acceptor {
    settings: Arc<Settings>,
    listener: OnceLock<TcpListener>,
    stopping: watch::Sender<bool>,
}

impl Acceptor {
    /// Create an idle acceptor
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        let (stopping, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            listener: OnceLock::new(),
            stopping,
        })
    }

    /// Bind the listening socket on all interfaces
    pub async fn listen(&self, port: u16) -> Code {
        self.listen_on(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))
            .await
    }

    /// Bind the listening socket on a specific address
    pub async fn listen_on(&self, addr: SocketAddr) -> Code {
        if self.stopped() {
            return Err(NetworkError::ServiceStopped);
        }

        let listener = listen_tcp(addr).await.map_err(|e| {
            warn!("Failed to bind {}: {}", addr, e);
            NetworkError::AcceptFailed(e.to_string())
        })?;

        let local = listener.local_addr().ok();
        self.listener
            .set(listener)
            .map_err(|_| NetworkError::OperationFailed)?;

        if let Some(local) = local {
            info!("Listening for peers on {}", local);
        }
        Ok(())
    }

    /// Bound address, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.get().and_then(|l| l.local_addr().ok())
    }

    /// Wait for the next connection
    pub async fn accept(&self) -> Result<Arc<Channel>, NetworkError> {
        let mut stopping = self.stopping.subscribe();
        if *stopping.borrow() {
            return Err(NetworkError::ServiceStopped);
        }

        let listener = self.listener.get().ok_or(NetworkError::OperationFailed)?;

        tokio::select! {
            _ = stopping.wait_for(|stopped| *stopped) => Err(NetworkError::ServiceStopped),
            result = listener.accept() => {
                let (stream, addr) = result
                    .map_err(|e| NetworkError::AcceptFailed(e.to_string()))?;
                stream.set_nodelay(true)?;
                Ok(Channel::new(
                    IoStream::Plain(stream),
                    Authority::from(addr),
                    &self.settings,
                ))
            }
        }
    }

    /// Cancel a pending accept and refuse further ones
    pub fn stop(&self) {
        self.stopping.send_replace(true);
    }

    /// True once stopped
    pub fn stopped(&self) -> bool {
        *self.stopping.borrow()
    }
}
