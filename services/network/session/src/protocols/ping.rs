//! Keepalive with ping/pong and RTT measurement.
//!
//! Sends a ping every heartbeat and answers the peer's pings. Pong
//! correlation needs bip31, older peers only receive nonce-less keepalives.
//! A bip31 peer that has not answered by the next heartbeat times out.

use crate::channel::Channel;
use crate::error::NetworkError;
use p2p_wire::{level, Message};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// Attach the keepalive protocol to a registered channel
///
/// Runs until the channel stops.
pub fn attach(channel: &Arc<Channel>, heartbeat: Duration) {
    let mut messages = channel.subscribe();
    let channel = channel.clone();

    tokio::spawn(async move {
        let mut outstanding: Option<(u64, Instant)> = None;
        let mut interval = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = channel.wait_stopped() => break,
                _ = interval.tick() => {
                    let pong_capable = channel.negotiated_version() >= level::BIP31;
                    if pong_capable && outstanding.is_some() {
                        debug!("Ping timeout [{}]", channel.authority());
                        channel.stop(Err(NetworkError::ChannelTimeout));
                        break;
                    }

                    let nonce = if pong_capable { rand::thread_rng().gen() } else { 0 };
                    if pong_capable {
                        outstanding = Some((nonce, Instant::now()));
                    }

                    if channel.send(Message::Ping { nonce }).await.is_err() {
                        break;
                    }
                }
                message = messages.recv() => match message {
                    Ok(Message::Ping { nonce }) => {
                        if channel.negotiated_version() >= level::BIP31
                            && channel.send(Message::Pong { nonce }).await.is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Pong { nonce }) => match outstanding {
                        Some((expected, sent)) if expected == nonce => {
                            outstanding = None;
                            trace!("Pong from [{}] rtt {:?}", channel.authority(), sent.elapsed());
                        }
                        _ => {
                            debug!("Unexpected pong from [{}]", channel.authority());
                            channel.stop(Err(NetworkError::BadStream(
                                "unexpected pong".to_string(),
                            )));
                            break;
                        }
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        trace!("Ping protocol skipped {} messages", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}
