//! Sessions: the admission sequence and the connection strategies built on it.

mod inbound;
mod manual;
mod outbound;
mod session;

pub use inbound::InboundSession;
pub use manual::ManualSession;
pub use outbound::OutboundSession;
pub use session::{Direction, Session};

use crate::authority::Authority;
use crate::channel::Channel;
use crate::error::{Code, NetworkError};
use crate::protocols::ping;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::trace;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAXIMUM_BACKOFF: Duration = Duration::from_secs(30);

fn next_backoff(backoff: Duration) -> Duration {
    (backoff * 2).min(MAXIMUM_BACKOFF)
}

/// Watch flipped by the network's stop signal
fn stop_watch(session: &Session) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    session.subscribe_stop(move |_| {
        tx.send_replace(true);
    });
    rx
}

/// Sleep, returning false if the network stopped first
async fn pause(stopping: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = stopping.wait_for(|stopped| *stopped) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Dial, register and attach keepalive
///
/// Resolves with the channel once admitted; the receiver resolves with the
/// channel's stop code.
async fn connect(
    session: &Arc<Session>,
    authority: Authority,
) -> Result<(Arc<Channel>, oneshot::Receiver<Code>), NetworkError> {
    let connector = session.create_connector();
    session.pend_connector(&connector)?;
    let connected = connector.connect(authority).await;
    session.unpend_connector(&connector);
    let channel = connected?;

    let (started, stopped) = session.admit(channel.clone()).await;
    started?;

    trace!("Attach ping [{}]", channel.authority());
    ping::attach(&channel, session.settings().channel_heartbeat());
    Ok((channel, stopped))
}
