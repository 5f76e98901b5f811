//! Version handshake.
//!
//! Both variants exchange version and verack messages and record the peer's
//! version on the channel. The reject-aware variant, used once the channel
//! speaks bip61, also tells an obsolete peer why it is being dropped and
//! treats a peer's reject of our version as a failed handshake.

use crate::channel::Channel;
use crate::error::{Code, NetworkError};
use crate::settings::Settings;
use p2p_wire::{level, Message, RejectMessage, VersionMessage};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, trace};

/// Handshake variant attached to a new channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Version and verack only
    Legacy,
    /// Version and verack, with reject messages
    RejectAware,
}

impl Handshake {
    /// Select the variant for a negotiated protocol version
    pub fn for_version(version: u32) -> Self {
        if version >= level::BIP61 {
            Handshake::RejectAware
        } else {
            Handshake::Legacy
        }
    }

    /// Subscribe to the channel and run the exchange in the background
    ///
    /// The subscription is taken before this returns, so attaching from a
    /// channel start handler observes every message the peer sends. The
    /// handler is invoked exactly once with the handshake result.
    pub fn attach_and_start<F>(self, channel: &Arc<Channel>, settings: Arc<Settings>, handler: F)
    where
        F: FnOnce(Code) + Send + 'static,
    {
        let messages = channel.subscribe();
        let channel = channel.clone();

        trace!("Attach {:?} handshake [{}]", self, channel.authority());

        tokio::spawn(async move {
            let exchange = tokio::time::timeout(
                settings.channel_handshake(),
                self.exchange(&channel, &settings, messages),
            );

            let result = tokio::select! {
                _ = channel.wait_stopped() => Err(NetworkError::ChannelStopped),
                result = exchange => result.unwrap_or(Err(NetworkError::ChannelTimeout)),
            };

            match &result {
                Ok(()) => debug!(
                    "Handshake complete [{}] version {}",
                    channel.authority(),
                    channel.negotiated_version()
                ),
                Err(e) => debug!("Handshake failed [{}] {}", channel.authority(), e),
            }

            handler(result);
        });
    }

    async fn exchange(
        self,
        channel: &Channel,
        settings: &Settings,
        mut messages: broadcast::Receiver<Message>,
    ) -> Code {
        channel
            .send(Message::Version(version_message(channel, settings)))
            .await?;

        let mut received_version = false;
        let mut received_verack = false;

        while !(received_version && received_verack) {
            let message = match messages.recv().await {
                Ok(message) => message,
                Err(RecvError::Lagged(skipped)) => {
                    return Err(NetworkError::Handshake(format!(
                        "dropped {} messages",
                        skipped
                    )))
                }
                Err(RecvError::Closed) => return Err(NetworkError::ChannelStopped),
            };

            match message {
                Message::Version(version) => {
                    if received_version {
                        return Err(NetworkError::Handshake("duplicate version".to_string()));
                    }

                    self.handle_version(channel, settings, version).await?;
                    received_version = true;
                }
                Message::Verack => received_verack = true,
                Message::Reject(reject)
                    if self == Handshake::RejectAware && reject.message == "version" =>
                {
                    return Err(NetworkError::Handshake(format!(
                        "version rejected ({:?}) {}",
                        reject.code, reject.reason
                    )));
                }
                other => trace!(
                    "Ignoring {} during handshake [{}]",
                    other,
                    channel.authority()
                ),
            }
        }

        Ok(())
    }

    async fn handle_version(
        self,
        channel: &Channel,
        settings: &Settings,
        version: VersionMessage,
    ) -> Code {
        trace!(
            "Peer [{}] version {} ({}) services {}",
            channel.authority(),
            version.value,
            version.user_agent,
            version.services
        );

        if version.value < settings.protocol_minimum {
            if self == Handshake::RejectAware {
                let reason = format!(
                    "insufficient version {}, minimum {}",
                    version.value, settings.protocol_minimum
                );
                // Best effort, the channel is dropped either way.
                let _ = channel
                    .send(Message::Reject(RejectMessage::obsolete_version(reason)))
                    .await;
            }

            return Err(NetworkError::PeerInsufficient {
                peer: version.value,
                minimum: settings.protocol_minimum,
            });
        }

        channel.set_negotiated_version(version.value.min(settings.protocol_maximum));
        channel.set_peer_version(version);
        channel.send(Message::Verack).await
    }
}

fn version_message(channel: &Channel, settings: &Settings) -> VersionMessage {
    VersionMessage {
        value: settings.protocol_maximum,
        services: settings.services,
        timestamp: chrono::Utc::now().timestamp(),
        address_receiver: Some(channel.authority().to_socket_addr()),
        address_sender: settings.self_address.map(|address| address.to_socket_addr()),
        nonce: channel.nonce(),
        user_agent: settings.user_agent.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{memory_channel, version_message as peer_version, RemotePeer};
    use p2p_wire::RejectCode;
    use tokio::sync::oneshot;

    struct Fixture {
        channel: Arc<Channel>,
        remote: RemotePeer,
        result: oneshot::Receiver<Code>,
    }

    fn attach(handshake: Handshake, settings: Settings) -> Fixture {
        let settings = Arc::new(settings);
        let (channel, stream) = memory_channel(&settings);
        let remote = RemotePeer::new(stream, &settings);
        channel.set_nonce(77);

        let (tx, result) = oneshot::channel();
        let attached = channel.clone();
        channel.start(move |code| {
            assert_eq!(code, Ok(()));
            handshake.attach_and_start(&attached, settings, move |code| {
                let _ = tx.send(code);
            });
        });

        Fixture {
            channel,
            remote,
            result,
        }
    }

    #[test]
    fn test_variant_selection() {
        assert_eq!(Handshake::for_version(level::MINIMUM), Handshake::Legacy);
        assert_eq!(Handshake::for_version(level::BIP37), Handshake::Legacy);
        assert_eq!(Handshake::for_version(level::BIP61), Handshake::RejectAware);
        assert_eq!(Handshake::for_version(level::MAXIMUM), Handshake::RejectAware);
    }

    #[tokio::test]
    async fn test_handshake_records_peer() {
        let mut fixture = attach(Handshake::RejectAware, Settings::default());

        let local = fixture.remote.handshake(peer_version(level::BIP37, 5)).await;
        assert_eq!(local.nonce, 77);
        assert_eq!(local.value, level::MAXIMUM);

        assert_eq!(fixture.result.await.unwrap(), Ok(()));
        assert_eq!(fixture.channel.negotiated_version(), level::BIP37);
        assert_eq!(fixture.channel.peer_version().nonce, 5);
        assert_eq!(fixture.remote.recv().await, Some(Message::Verack));

        fixture.channel.stop(Ok(()));
    }

    #[tokio::test]
    async fn test_negotiated_version_capped_at_maximum() {
        let settings = Settings {
            protocol_maximum: level::BIP61,
            ..Settings::default()
        };
        let mut fixture = attach(Handshake::RejectAware, settings);

        fixture.remote.handshake(peer_version(level::MAXIMUM, 5)).await;

        assert_eq!(fixture.result.await.unwrap(), Ok(()));
        assert_eq!(fixture.channel.negotiated_version(), level::BIP61);
        fixture.channel.stop(Ok(()));
    }

    #[tokio::test]
    async fn test_legacy_insufficient_peer_without_reject() {
        let mut fixture = attach(Handshake::Legacy, Settings::default());

        fixture.remote.handshake(peer_version(300, 5)).await;

        assert_eq!(
            fixture.result.await.unwrap(),
            Err(NetworkError::PeerInsufficient {
                peer: 300,
                minimum: level::MINIMUM
            })
        );

        fixture.channel.stop(Ok(()));
    }

    #[tokio::test]
    async fn test_reject_aware_insufficient_peer_is_told() {
        let mut fixture = attach(Handshake::RejectAware, Settings::default());

        fixture.remote.handshake(peer_version(300, 5)).await;

        assert!(matches!(
            fixture.result.await.unwrap(),
            Err(NetworkError::PeerInsufficient { peer: 300, .. })
        ));
        match fixture.remote.recv().await {
            Some(Message::Reject(reject)) => {
                assert_eq!(reject.message, "version");
                assert_eq!(reject.code, RejectCode::Obsolete);
            }
            other => panic!("expected reject, got {:?}", other),
        }

        fixture.channel.stop(Ok(()));
    }

    #[tokio::test]
    async fn test_peer_reject_fails_reject_aware() {
        let mut fixture = attach(Handshake::RejectAware, Settings::default());
        fixture.remote.recv().await;

        fixture
            .remote
            .send(&Message::Reject(RejectMessage::obsolete_version("too new")))
            .await;

        assert!(matches!(
            fixture.result.await.unwrap(),
            Err(NetworkError::Handshake(_))
        ));
        fixture.channel.stop(Ok(()));
    }

    #[tokio::test]
    async fn test_duplicate_version_fails() {
        let mut fixture = attach(Handshake::Legacy, Settings::default());
        fixture.remote.recv().await;

        fixture
            .remote
            .send(&Message::Version(peer_version(level::BIP37, 5)))
            .await;
        fixture
            .remote
            .send(&Message::Version(peer_version(level::BIP37, 5)))
            .await;

        assert_eq!(
            fixture.result.await.unwrap(),
            Err(NetworkError::Handshake("duplicate version".to_string()))
        );
        fixture.channel.stop(Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let mut fixture = attach(Handshake::Legacy, Settings::default());
        fixture.remote.recv().await;

        assert_eq!(
            fixture.result.await.unwrap(),
            Err(NetworkError::ChannelTimeout)
        );
        fixture.channel.stop(Ok(()));
    }

    #[tokio::test]
    async fn test_channel_stop_ends_handshake() {
        let mut fixture = attach(Handshake::Legacy, Settings::default());
        fixture.remote.recv().await;

        fixture.channel.stop(Err(NetworkError::ServiceStopped));

        assert_eq!(
            fixture.result.await.unwrap(),
            Err(NetworkError::ChannelStopped)
        );
    }
}
