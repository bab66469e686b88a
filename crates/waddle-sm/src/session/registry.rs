//! Connection and account session registry.
//!
//! Owns every [`ResourceConnection`] and [`UserSession`] and performs the
//! identity transitions of the authorization state machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use jid::{BareJid, FullJid, Jid};
use tracing::{debug, info, instrument, warn};

use super::connection::ResourceConnection;
use super::user::UserSession;
use crate::error::SmError;
use crate::metrics;

/// Registry of open connections and the accounts they belong to.
pub struct SessionRegistry {
    domain: String,
    resource_prefix: String,
    connections: DashMap<Jid, Arc<ResourceConnection>>,
    users: DashMap<BareJid, Arc<UserSession>>,
    resource_counter: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry for a virtual host.
    ///
    /// `resource_prefix` seeds generated resource names, normally derived
    /// from the host name so that names differ across cluster nodes.
    pub fn new(domain: impl Into<String>, resource_prefix: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            resource_prefix: resource_prefix.into(),
            connections: DashMap::new(),
            users: DashMap::new(),
            resource_counter: AtomicU64::new(0),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Admit a new client connection.
    #[instrument(skip(self), fields(domain = %self.domain))]
    pub fn open(&self, connection_id: Jid, remote_address: Option<String>) -> Arc<ResourceConnection> {
        let mut connection = ResourceConnection::new(connection_id.clone(), self.domain.clone());
        if let Some(address) = remote_address {
            connection = connection.with_remote_address(address);
        }
        let connection = Arc::new(connection);

        if let Some(previous) = self
            .connections
            .insert(connection_id.clone(), Arc::clone(&connection))
        {
            warn!(connection_id = %connection_id, "Replacing existing connection");
            self.logout(&previous);
        }

        debug!(
            connection_id = %connection_id,
            session_id = %connection.session_id(),
            "Connection opened"
        );
        metrics::record_session_count(self.connections.len() as i64);
        connection
    }

    pub fn get(&self, connection_id: &Jid) -> Option<Arc<ResourceConnection>> {
        self.connections.get(connection_id).map(|e| Arc::clone(e.value()))
    }

    pub fn user_session(&self, user: &BareJid) -> Option<Arc<UserSession>> {
        self.users.get(user).map(|e| Arc::clone(e.value()))
    }

    /// Live connections of an account.
    pub fn connections_for(&self, user: &BareJid) -> Vec<Arc<ResourceConnection>> {
        self.user_session(user)
            .map(|s| s.connections())
            .unwrap_or_default()
    }

    /// Bound full JIDs of an account.
    pub fn resources_for(&self, user: &BareJid) -> Vec<FullJid> {
        self.connections_for(user)
            .iter()
            .filter_map(|c| c.jid().ok())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Move a connection to the authenticated state for `user`.
    ///
    /// The connection joins the account's [`UserSession`], so common data
    /// written by any sibling becomes visible to it.
    #[instrument(skip(self, connection), fields(connection_id = %connection.connection_id()))]
    pub fn authorize(
        &self,
        connection: &Arc<ResourceConnection>,
        user: BareJid,
    ) -> Result<Arc<UserSession>, SmError> {
        if connection.is_authorized() {
            return Err(SmError::AlreadyAuthorized);
        }

        // Attach while holding the shard lock so a concurrent logout of the
        // last sibling cannot drop the user session in between.
        let attached = {
            let entry = self
                .users
                .entry(user.clone())
                .or_insert_with(|| Arc::new(UserSession::new(user.clone())));
            let parent = Arc::clone(entry.value());
            connection
                .attach(user.clone(), Arc::clone(&parent))
                .map(|()| {
                    parent.add_connection(connection);
                    parent
                })
        };
        let parent = match attached {
            Ok(parent) => parent,
            Err(e) => {
                // Lost a race with another authorization of this connection.
                self.users
                    .remove_if(&user, |_, session| session.connection_count() == 0);
                return Err(e);
            }
        };

        info!(user = %user, "Session authorized");
        Ok(parent)
    }

    /// Bind a resource to an authenticated connection.
    ///
    /// A missing, invalid or already used resource is replaced with a
    /// generated one. A second bind fails with
    /// [`SmError::ResourceAlreadyBound`] carrying the existing JID.
    #[instrument(skip(self, connection), fields(connection_id = %connection.connection_id()))]
    pub fn bind_resource(
        &self,
        connection: &Arc<ResourceConnection>,
        requested: Option<&str>,
    ) -> Result<FullJid, SmError> {
        let user = connection.bare_jid()?;
        if let Ok(existing) = connection.jid() {
            return Err(SmError::ResourceAlreadyBound(existing));
        }
        let parent = connection
            .user_session()
            .ok_or_else(|| SmError::not_authorized("session is not authorized yet"))?;

        let _guard = parent.bind_guard();
        let requested = requested.map(str::trim).filter(|r| !r.is_empty());
        let jid = match requested.map(|r| user.with_resource_str(r)) {
            Some(Ok(jid)) if !parent.resource_in_use(jid.resource().as_str()) => jid,
            Some(Ok(jid)) => {
                debug!(requested = %jid, "Resource in use, generating one");
                self.generate_jid(&user, &parent)?
            }
            Some(Err(e)) => {
                debug!(error = %e, "Invalid resource requested, generating one");
                self.generate_jid(&user, &parent)?
            }
            None => self.generate_jid(&user, &parent)?,
        };

        connection.bind(jid.clone())?;
        info!(jid = %jid, "Resource bound");
        Ok(jid)
    }

    /// Next server-generated resource name.
    pub fn generate_resource(&self) -> String {
        let n = self.resource_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.resource_prefix, n)
    }

    fn generate_jid(&self, user: &BareJid, parent: &UserSession) -> Result<FullJid, SmError> {
        loop {
            let resource = self.generate_resource();
            if !parent.resource_in_use(&resource) {
                return Ok(user.with_resource_str(&resource)?);
            }
        }
    }

    /// Log the connection out, keeping the transport connection registered.
    ///
    /// Clears identity and connection data; the account session is dropped
    /// once its last connection leaves.
    #[instrument(skip(self, connection), fields(connection_id = %connection.connection_id()))]
    pub fn logout(&self, connection: &Arc<ResourceConnection>) -> Option<BareJid> {
        let user = connection.bare_jid().ok();
        let parent = connection.reset()?;
        let remaining = parent.remove_connection(connection.connection_id());
        if remaining == 0 {
            self.users
                .remove_if(parent.bare_jid(), |_, session| session.connection_count() == 0);
        }
        if let Some(user) = &user {
            info!(user = %user, remaining, "Session logged out");
        }
        user
    }

    /// Remove a connection entirely, logging it out first.
    #[instrument(skip(self))]
    pub fn close(&self, connection_id: &Jid) -> Option<Arc<ResourceConnection>> {
        let (_, connection) = self.connections.remove(connection_id)?;
        self.logout(&connection);
        debug!("Connection closed");
        metrics::record_session_count(self.connections.len() as i64);
        Some(connection)
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("domain", &self.domain)
            .field("connections", &self.connections.len())
            .field("users", &self.users.len())
            .finish()
    }
}
