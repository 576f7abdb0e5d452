//! Connection registry.
//!
//! Maintains the process-wide mapping from logical user id to the active
//! connection handle. One entry per user: a reconnect overwrites the
//! previous handle (last connection wins, no fan-out to multiple devices).
//! Absence of an entry means the user is offline and events addressed to
//! them are silently dropped.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_shared::events::ServerEvent;
use parley_shared::types::UserId;

/// Identifies one physical connection, so a late disconnect from an
/// overwritten connection cannot evict the entry of a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct ClientHandle {
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Registry of currently-connected clients.
///
/// Mutated only by the connect/disconnect handlers; lookups from the
/// event routers hold the lock just long enough to clone the sender.
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<UserId, ClientHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register a connection for `user_id`, overwriting any previous one.
    pub fn register(&self, user_id: UserId, conn_id: ConnId, tx: mpsc::UnboundedSender<ServerEvent>) {
        let mut map = self.inner.lock().expect("registry lock");
        if map.insert(user_id.clone(), ClientHandle { conn_id, tx }).is_some() {
            debug!(user = %user_id.short(), "Replaced existing connection for user");
        }
    }

    /// Remove the entry for `user_id`, but only if it still belongs to
    /// `conn_id`. Returns whether an entry was removed.
    pub fn deregister(&self, user_id: &UserId, conn_id: ConnId) -> bool {
        let mut map = self.inner.lock().expect("registry lock");
        match map.get(user_id) {
            Some(handle) if handle.conn_id == conn_id => {
                map.remove(user_id);
                true
            }
            Some(_) => {
                debug!(user = %user_id.short(), "Skipping deregister of superseded connection");
                false
            }
            None => false,
        }
    }

    /// Forward an event to `user_id`'s connection if one is registered.
    ///
    /// Offline targets are a silent drop: no error to the sender, no
    /// queueing. Returns whether the event was handed to a connection.
    pub fn emit_to(&self, user_id: &UserId, event: ServerEvent) -> bool {
        let tx = {
            let map = self.inner.lock().expect("registry lock");
            match map.get(user_id) {
                Some(handle) => handle.tx.clone(),
                None => {
                    debug!(user = %user_id.short(), "Target offline, dropping event");
                    return false;
                }
            }
        };

        if tx.send(event).is_err() {
            // The socket task is gone but has not deregistered yet.
            warn!(user = %user_id.short(), "Connection channel closed, dropping event");
            return false;
        }
        true
    }

    /// Send an event to every connected client.
    pub fn broadcast(&self, event: ServerEvent) {
        let map = self.inner.lock().expect("registry lock");
        for handle in map.values() {
            let _ = handle.tx.send(event.clone());
        }
    }

    /// Snapshot of all currently-online user ids.
    pub fn online_users(&self) -> Vec<UserId> {
        let map = self.inner.lock().expect("registry lock");
        map.keys().cloned().collect()
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        let map = self.inner.lock().expect("registry lock");
        map.contains_key(user_id)
    }

    pub fn connection_count(&self) -> usize {
        let map = self.inner.lock().expect("registry lock");
        map.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
