//! Connection registry: the set of live acceptor-side connections.
//!
//! The [`ConnectionRegistry`] records every connection a listener accepted,
//! together with the peer address and the public key the peer presented in
//! its handshake. Acceptors consult it to confirm the peer key before they
//! flip to ready, and leave it when they disconnect.

use crate::connection::Connection;
use crate::keys::PublicKey;
use crate::packet::Packet;
use chrono::{DateTime, Utc};
use sealink_types::ConnectionId;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A registered connection.
#[derive(Debug, Clone)]
pub struct RegistryEntry<M: Packet> {
    pub connection: Arc<Connection<M>>,
    /// Remote socket address.
    pub address: SocketAddr,
    /// Key from the peer's handshake. `None` in plaintext mode.
    pub public_key: Option<PublicKey>,
    /// When the connection joined.
    pub joined_at: DateTime<Utc>,
}

/// Thread-safe registry of accepted connections, keyed by connection id.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry<M: Packet> {
    entries: Arc<RwLock<HashMap<ConnectionId, RegistryEntry<M>>>>,
}

impl<M: Packet> ConnectionRegistry<M> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a connection, recording its peer key as currently known.
    pub fn join(&self, connection: &Arc<Connection<M>>) {
        let entry = RegistryEntry {
            connection: Arc::clone(connection),
            address: connection.peer_addr(),
            public_key: connection.peer_public_key().cloned(),
            joined_at: Utc::now(),
        };
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(connection.id(), entry);
        debug!(
            "Registry: {} joined from {} ({} live)",
            connection.id(),
            connection.peer_addr(),
            entries.len()
        );
    }

    /// Remove a connection. Returns its entry if it was registered.
    pub fn exit(&self, connection: &Connection<M>) -> Option<RegistryEntry<M>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let removed = entries.remove(&connection.id());
        if removed.is_some() {
            debug!("Registry: {} left ({} live)", connection.id(), entries.len());
        }
        removed
    }

    /// The key the registry holds for `connection`, if any.
    pub fn public_key_of(&self, connection: &Connection<M>) -> Option<PublicKey> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&connection.id())
            .and_then(|entry| entry.public_key.clone())
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection<M>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(id).map(|entry| Arc::clone(&entry.connection))
    }

    /// Find the connection whose peer is exactly `address`.
    pub fn lookup(&self, address: &SocketAddr) -> Option<Arc<Connection<M>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .find(|entry| entry.address == *address)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Find a connection from host `ip`, any port.
    pub fn lookup_ip(&self, ip: IpAddr) -> Option<Arc<Connection<M>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .find(|entry| entry.address.ip() == ip)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// Snapshot of all registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection<M>>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .values()
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: Packet> Default for ConnectionRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}
