//! Per-account state shared by all connections of one user.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use dashmap::DashMap;
use jid::{BareJid, Jid};

use super::connection::ResourceConnection;
use super::data::TypedMap;

/// Account-level session: common data plus the set of live connections.
///
/// Connections hold a strong reference to their `UserSession`; the session
/// only keeps weak references back, so dropping a connection never leaks
/// the account.
pub struct UserSession {
    bare_jid: BareJid,
    common: TypedMap,
    connections: DashMap<Jid, Weak<ResourceConnection>>,
    bind_lock: Mutex<()>,
}

impl UserSession {
    pub fn new(bare_jid: BareJid) -> Self {
        Self {
            bare_jid,
            common: TypedMap::new(),
            connections: DashMap::new(),
            bind_lock: Mutex::new(()),
        }
    }

    pub fn bare_jid(&self) -> &BareJid {
        &self.bare_jid
    }

    /// Data visible to every connection of this account.
    pub fn common(&self) -> &TypedMap {
        &self.common
    }

    /// Live connections, in no particular order.
    pub fn connections(&self) -> Vec<Arc<ResourceConnection>> {
        self.connections
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Whether a sibling connection already uses this resource.
    pub fn resource_in_use(&self, resource: &str) -> bool {
        self.connections()
            .iter()
            .any(|c| c.resource().as_deref() == Some(resource))
    }

    /// Serializes resource selection across sibling connections.
    pub(crate) fn bind_guard(&self) -> MutexGuard<'_, ()> {
        self.bind_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn add_connection(&self, connection: &Arc<ResourceConnection>) {
        self.connections
            .insert(connection.connection_id().clone(), Arc::downgrade(connection));
    }

    /// Remove a connection; returns how many remain.
    pub(crate) fn remove_connection(&self, connection_id: &Jid) -> usize {
        self.connections.remove(connection_id);
        self.connections
            .retain(|_, weak| weak.strong_count() > 0);
        self.connections.len()
    }
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("bare_jid", &self.bare_jid)
            .field("connections", &self.connections.len())
            .field("common", &self.common)
            .finish()
    }
}
