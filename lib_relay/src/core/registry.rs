//! # Connection Registry
//!
//! The set of currently open client sessions, shared by the router and the
//! session controller. It is constructed once by the server and passed in as
//! an `Arc`; nothing reaches it through a global.
//!
//! Broadcasts never iterate the live map. `snapshot` clones the handles out
//! under the lock and releases it immediately, so a broadcast in progress can
//! neither block nor be corrupted by concurrent `add`/`remove`, and a client
//! removed mid-broadcast is skipped because its handle reports closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::connection::{ClientConnection, ClientId};
use crate::core::error::{RelayError, RelayResult};

/// Thread-safe set of open client connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: Arc<Mutex<HashMap<ClientId, ClientConnection>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClientId, ClientConnection>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a connection. Fails if its id is already present.
    pub fn add(&self, conn: ClientConnection) -> RelayResult<()> {
        let mut clients = self.lock();
        let id = conn.id();
        if clients.contains_key(&id) {
            return Err(RelayError::DuplicateConnection(id));
        }
        clients.insert(id, conn);
        tracing::debug!(client_id = id, clients = clients.len(), "client registered");
        Ok(())
    }

    /// Deregisters a connection. Absent ids are ignored because close events
    /// may race each other.
    pub fn remove(&self, id: ClientId) -> Option<ClientConnection> {
        let removed = self.lock().remove(&id);
        if let Some(conn) = &removed {
            conn.mark_closed();
        }
        removed
    }

    /// Point-in-time copy of the registered connections.
    pub fn snapshot(&self) -> Vec<ClientConnection> {
        self.lock().values().cloned().collect()
    }

    /// Snapshot of every connection except `id`.
    pub fn snapshot_except(&self, id: ClientId) -> Vec<ClientConnection> {
        self.lock()
            .iter()
            .filter(|(other, _)| **other != id)
            .map(|(_, conn)| conn.clone())
            .collect()
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ClientId) -> bool {
        self.lock().contains_key(&id)
    }
}
