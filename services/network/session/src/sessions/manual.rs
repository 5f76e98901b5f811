//! Maintains connections to explicitly configured peers.

use super::session::{Direction, Session};
use super::{connect, next_backoff, pause, stop_watch, INITIAL_BACKOFF};
use crate::authority::Authority;
use crate::error::{Code, NetworkError};
use crate::network::Network;
use crate::settings::Settings;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Manual connection session
#[derive(Debug)]
pub struct ManualSession {
    session: Arc<Session>,
}

impl ManualSession {
    /// Create an unstarted manual session
    pub fn new(network: Arc<dyn Network>, settings: Arc<Settings>) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(network, settings, true, Direction::Outbound),
        })
    }

    /// Underlying admission session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Start the session
    pub fn start(&self) -> Code {
        let mut result = Ok(());
        self.session.start(|code| result = code);
        result
    }

    /// Keep a connection to the peer until the network stops
    ///
    /// Failed attempts back off and are retried up to the configured attempt
    /// limit (zero retries forever). A channel that stops after admission is
    /// reconnected.
    pub fn connect(self: &Arc<Self>, authority: Authority) -> JoinHandle<()> {
        tokio::spawn(self.clone().maintain(authority))
    }

    async fn maintain(self: Arc<Self>, authority: Authority) {
        let limit = self.session.settings().manual_attempt_limit;
        let mut stopping = stop_watch(&self.session);
        let mut backoff = INITIAL_BACKOFF;
        let mut attempts = 0u32;

        while !self.session.stopped() {
            match connect(&self.session, authority).await {
                Ok((channel, stopped)) => {
                    info!("Connected manual channel [{}]", channel.authority());
                    attempts = 0;
                    backoff = INITIAL_BACKOFF;

                    let code = stopped.await.unwrap_or(Err(NetworkError::OperationCanceled));
                    debug!(
                        "Manual channel stopped [{}] {}",
                        authority,
                        code.err().map(|e| e.to_string()).unwrap_or_default()
                    );

                    if !pause(&mut stopping, INITIAL_BACKOFF).await {
                        break;
                    }
                }
                Err(e) if e.is_stop() => break,
                Err(e) => {
                    attempts += 1;
                    if limit != 0 && attempts >= limit {
                        warn!(
                            "Giving up on manual connection [{}] after {} attempts: {}",
                            authority, attempts, e
                        );
                        break;
                    }

                    debug!(
                        "Manual connection [{}] failed: {}; retrying in {:?}",
                        authority, e, backoff
                    );
                    if !pause(&mut stopping, backoff).await {
                        break;
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }
    }
}
