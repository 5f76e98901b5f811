//! Outbound socket factory.

use crate::authority::Authority;
use crate::channel::Channel;
use crate::error::NetworkError;
use crate::settings::Settings;
use crate::transport::{connect_tcp, IoStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Dials peers, one attempt at a time
#[derive(Debug)]
pub struct Connector {
    id: u64,
    settings: Arc<Settings>,
    stopping: watch::Sender<bool>,
}

impl Connector {
    /// Create a connector with a process-unique id
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        let (stopping, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            stopping,
        })
    }

    /// Identity used to pend the connector with the network
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Connect within the configured timeout
    pub async fn connect(&self, authority: Authority) -> Result<Arc<Channel>, NetworkError> {
        let mut stopping = self.stopping.subscribe();
        if *stopping.borrow() {
            return Err(NetworkError::ServiceStopped);
        }

        trace!("Connecting to [{}] (connector {})", authority, self.id);

        let attempt = tokio::time::timeout(
            self.settings.connect_timeout(),
            connect_tcp(authority.to_socket_addr()),
        );

        let stream = tokio::select! {
            _ = stopping.wait_for(|stopped| *stopped) => return Err(NetworkError::ServiceStopped),
            result = attempt => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Failed to connect to [{}] {}", authority, e);
                    return Err(NetworkError::ConnectFailed(e.to_string()));
                }
                Err(_) => {
                    debug!("Timed out connecting to [{}]", authority);
                    return Err(NetworkError::ChannelTimeout);
                }
            },
        };

        Ok(Channel::new(IoStream::Plain(stream), authority, &self.settings))
    }

    /// Cancel any in-flight attempt and refuse further ones
    pub fn stop(&self) {
        self.stopping.send_replace(true);
    }

    /// True once stopped
    pub fn stopped(&self) -> bool {
        *self.stopping.borrow()
    }
}
