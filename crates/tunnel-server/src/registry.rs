//! Pending request registry: suspended connections keyed by connection id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;
use tunnel_core::{ConnectionId, TransportKind};

use crate::connection::Connection;

/// Concurrent map of currently suspended connections.
#[derive(Default)]
pub struct PendingRegistry {
    entries: DashMap<ConnectionId, Arc<Connection>>,
}

impl PendingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suspended connection. Returns `false` if it was already present.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        let id = connection.id.clone();
        let inserted = self.entries.insert(id.clone(), connection).is_none();
        if inserted {
            debug!(
                connection_id = %id,
                pending = self.entries.len(),
                "registered suspended connection"
            );
        }
        inserted
    }

    /// Look up a suspended connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.entries.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove an entry. Removing an absent id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.entries.remove(id).map(|(_, conn)| conn);
        if removed.is_some() {
            debug!(
                connection_id = %id,
                pending = self.entries.len(),
                "removed suspended connection"
            );
        }
        removed
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every registered connection.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.entries.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Long-poll sessions not polled within `ttl`.
    pub fn stale_polls(&self, ttl: Duration) -> Vec<Arc<Connection>> {
        self.entries
            .iter()
            .filter(|entry| entry.transport() == TransportKind::LongPoll && entry.idle_for() > ttl)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
