//! Process-wide peer registry.
//!
//! [`Network`] is everything a session needs from the node: the address
//! pool, the authoritative store of live channels, reservations for in-flight
//! connects and handshakes, and the node-wide stop signal. Every operation is
//! atomic with respect to concurrent callers; in particular two sessions
//! racing to store colliding channels yield exactly one success.

use crate::authority::Authority;
use crate::channel::Channel;
use crate::connector::Connector;
use crate::error::{Code, NetworkError, ResultHandler};
use crate::settings::Settings;
use crate::subscriber::StopSubscriber;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

/// Registry contract consumed by sessions
pub trait Network: Send + Sync + std::fmt::Debug {
    /// Number of known peer addresses
    fn address_count(&self) -> usize;

    /// Number of stored channels
    fn connection_count(&self) -> usize;

    /// A candidate peer address, `AddressNotFound` when the pool is empty
    fn fetch_address(&self) -> Result<Authority, NetworkError>;

    /// Reserve a slot for an in-flight connect
    fn pend_connector(&self, connector: &Arc<Connector>) -> Code;

    /// Release a connect reservation
    fn unpend_connector(&self, connector: &Arc<Connector>);

    /// Reserve a slot for an in-flight handshake, keyed by channel nonce
    fn pend_channel(&self, channel: &Arc<Channel>) -> Code;

    /// Release a handshake reservation
    fn unpend_channel(&self, channel: &Arc<Channel>);

    /// True if a handshake with this nonce is reserved
    fn pending(&self, nonce: u64) -> bool;

    /// Register a channel, `AddressInUse` on an authority or nonce collision
    fn store(&self, channel: &Arc<Channel>) -> Code;

    /// Deregister a channel, a no-op if it is not stored
    fn remove(&self, channel: &Arc<Channel>);

    /// Invoke the handler once when the node stops
    fn subscribe_stop(&self, handler: ResultHandler);
}

/// In-memory [`Network`] implementation
#[derive(Debug)]
pub struct NetworkManager {
    settings: Arc<Settings>,
    hosts: Mutex<Vec<Authority>>,
    channels: Mutex<Vec<Arc<Channel>>>,
    pending_connectors: DashMap<u64, Arc<Connector>>,
    pending_channels: DashMap<u64, Arc<Channel>>,
    stop_subscriber: StopSubscriber,
    stopped: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NetworkManager {
    /// Create a running network seeded with the configured hosts
    pub fn new(settings: Arc<Settings>) -> Arc<Self> {
        let network = Arc::new(Self {
            hosts: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            pending_connectors: DashMap::new(),
            pending_channels: DashMap::new(),
            stop_subscriber: StopSubscriber::new(),
            stopped: AtomicBool::new(false),
            settings,
        });

        for host in &network.settings.hosts {
            network.store_address(*host);
        }

        network
    }

    /// Network settings
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Add an address to the pool, false if known or the pool is full
    pub fn store_address(&self, authority: Authority) -> bool {
        let mut hosts = lock(&self.hosts);
        if hosts.len() >= self.settings.host_pool_capacity || hosts.contains(&authority) {
            return false;
        }

        hosts.push(authority);
        true
    }

    /// Drop an address from the pool
    pub fn remove_address(&self, authority: &Authority) -> bool {
        let mut hosts = lock(&self.hosts);
        let before = hosts.len();
        hosts.retain(|host| host != authority);
        hosts.len() != before
    }

    /// Snapshot of stored channels
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        lock(&self.channels).clone()
    }

    /// True once stopped
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Signal stop to subscribers, then stop every channel and connector
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Network stopping");
        self.stop_subscriber.relay(Err(NetworkError::ServiceStopped));

        // Stop outside the lock, stop handlers call back into remove.
        let channels = lock(&self.channels).clone();
        for channel in channels {
            channel.stop(Err(NetworkError::ServiceStopped));
        }

        let pending: Vec<_> = self
            .pending_channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in pending {
            channel.stop(Err(NetworkError::ServiceStopped));
        }

        let connectors: Vec<_> = self
            .pending_connectors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for connector in connectors {
            connector.stop();
        }
    }
}

impl Network for NetworkManager {
    fn address_count(&self) -> usize {
        lock(&self.hosts).len()
    }

    fn connection_count(&self) -> usize {
        lock(&self.channels).len()
    }

    fn fetch_address(&self) -> Result<Authority, NetworkError> {
        let hosts = lock(&self.hosts);
        if hosts.is_empty() {
            return Err(NetworkError::AddressNotFound);
        }

        let index = rand::thread_rng().gen_range(0..hosts.len());
        Ok(hosts[index])
    }

    fn pend_connector(&self, connector: &Arc<Connector>) -> Code {
        if self.stopped() {
            return Err(NetworkError::ServiceStopped);
        }

        match self.pending_connectors.entry(connector.id()) {
            Entry::Occupied(_) => Err(NetworkError::OperationFailed),
            Entry::Vacant(entry) => {
                entry.insert(connector.clone());
                Ok(())
            }
        }
    }

    fn unpend_connector(&self, connector: &Arc<Connector>) {
        self.pending_connectors.remove(&connector.id());
    }

    fn pend_channel(&self, channel: &Arc<Channel>) -> Code {
        if self.stopped() {
            return Err(NetworkError::ServiceStopped);
        }

        match self.pending_channels.entry(channel.nonce()) {
            Entry::Occupied(_) => Err(NetworkError::AddressInUse),
            Entry::Vacant(entry) => {
                trace!("Pend channel [{}] nonce {}", channel.authority(), channel.nonce());
                entry.insert(channel.clone());
                Ok(())
            }
        }
    }

    fn unpend_channel(&self, channel: &Arc<Channel>) {
        self.pending_channels
            .remove_if(&channel.nonce(), |_, pended| Arc::ptr_eq(pended, channel));
    }

    fn pending(&self, nonce: u64) -> bool {
        self.pending_channels.contains_key(&nonce)
    }

    fn store(&self, channel: &Arc<Channel>) -> Code {
        let mut channels = lock(&self.channels);

        // Checked under the lock so a racing stop cannot miss this channel.
        if self.stopped() {
            return Err(NetworkError::ServiceStopped);
        }

        let collision = channels.iter().any(|stored| {
            stored.authority() == channel.authority() || stored.nonce() == channel.nonce()
        });

        if collision {
            debug!("Duplicate channel [{}]", channel.authority());
            return Err(NetworkError::AddressInUse);
        }

        channels.push(channel.clone());
        debug!(
            "Stored channel [{}] ({} connections)",
            channel.authority(),
            channels.len()
        );
        Ok(())
    }

    fn remove(&self, channel: &Arc<Channel>) {
        let mut channels = lock(&self.channels);
        let before = channels.len();
        channels.retain(|stored| !Arc::ptr_eq(stored, channel));

        if channels.len() != before {
            debug!(
                "Removed channel [{}] ({} connections)",
                channel.authority(),
                channels.len()
            );
        }
    }

    fn subscribe_stop(&self, handler: ResultHandler) {
        self.stop_subscriber.subscribe(handler);
    }
}
