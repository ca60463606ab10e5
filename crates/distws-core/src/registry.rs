//! Registry of locally attached connections.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::connection::Connection;
use crate::error::{Error, Result};

/// Connections attached to this process, keyed by identity.
///
/// Only the distribution manager mutates the registry. Readers work on
/// point-in-time snapshots, so iterating never races with adds or removes.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection. Fails if its identity is already taken.
    pub fn add(&self, connection: Arc<Connection>) -> Result<()> {
        match self.connections.entry(connection.id().to_string()) {
            Entry::Occupied(entry) => Err(Error::DuplicateConnection(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(connection);
                Ok(())
            }
        }
    }

    /// Remove a connection. Removing an absent id is a no-op.
    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.remove(id).map(|(_, connection)| connection)
    }

    /// Remove `connection` if it is the entry registered under its id.
    ///
    /// A newer connection that reused the id is left in place.
    pub fn remove_entry(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .remove_if(connection.id(), |_, registered| {
                Arc::ptr_eq(registered, connection)
            })
            .is_some()
    }

    /// Look up a connection.
    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Check if a connection is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Snapshot of every registered connection.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of connections with a pattern matching `topic`.
    ///
    /// Each connection appears at most once, however many of its patterns
    /// match.
    pub fn subscribed_to(&self, topic: &str) -> Vec<Arc<Connection>> {
        self.all()
            .into_iter()
            .filter(|connection| connection.is_subscribed_to(topic))
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
