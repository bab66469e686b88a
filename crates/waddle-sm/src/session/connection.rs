//! Per-resource connection state.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeZone, Utc};
use jid::{BareJid, FullJid, Jid};

use super::data::{DataKey, TypedMap};
use super::user::UserSession;
use crate::error::SmError;

/// Authorization state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthState {
    /// Stream open, no credentials accepted yet
    Unauthenticated,
    /// Credentials accepted, no resource bound
    Authenticated,
    /// Resource bound, full JID assigned
    ResourceBound,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::ResourceBound => "resource-bound",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Default)]
struct Identity {
    user: Option<BareJid>,
    jid: Option<FullJid>,
    parent: Option<Arc<UserSession>>,
}

/// State of one client connection.
///
/// Identity transitions (authorize, bind, logout) are driven by
/// [`SessionRegistry`](super::SessionRegistry); processors read the state
/// and store their own data in typed slots.
pub struct ResourceConnection {
    connection_id: Jid,
    domain: String,
    session_id: String,
    remote_address: Option<String>,
    created_at: DateTime<Utc>,
    last_accessed: AtomicI64,
    identity: RwLock<Identity>,
    data: TypedMap,
}

impl ResourceConnection {
    /// Create a connection in the unauthenticated state.
    pub fn new(connection_id: Jid, domain: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            domain: domain.into(),
            session_id: uuid::Uuid::now_v7().to_string(),
            remote_address: None,
            created_at: now,
            last_accessed: AtomicI64::new(now.timestamp_millis()),
            identity: RwLock::new(Identity::default()),
            data: TypedMap::new(),
        }
    }

    pub fn with_remote_address(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    /// Transport address of this connection.
    pub fn connection_id(&self) -> &Jid {
        &self.connection_id
    }

    /// Virtual host the client connected to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Stream id assigned at connection time.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn touch(&self) {
        self.last_accessed
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        let millis = self.last_accessed.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn auth_state(&self) -> AuthState {
        let identity = self.read();
        match (&identity.user, &identity.jid) {
            (None, _) => AuthState::Unauthenticated,
            (Some(_), None) => AuthState::Authenticated,
            (Some(_), Some(_)) => AuthState::ResourceBound,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.read().user.is_some()
    }

    pub fn is_resource_bound(&self) -> bool {
        self.read().jid.is_some()
    }

    /// Authenticated account, or `NotAuthorized`.
    pub fn bare_jid(&self) -> Result<BareJid, SmError> {
        self.read()
            .user
            .clone()
            .ok_or_else(|| SmError::not_authorized("session is not authorized yet"))
    }

    /// Bound full JID, or `NotAuthorized`.
    pub fn jid(&self) -> Result<FullJid, SmError> {
        self.read()
            .jid
            .clone()
            .ok_or_else(|| SmError::not_authorized("resource is not bound yet"))
    }

    pub fn resource(&self) -> Option<String> {
        self.read()
            .jid
            .as_ref()
            .map(|jid| jid.resource().as_str().to_string())
    }

    /// Account session shared with sibling connections.
    pub fn user_session(&self) -> Option<Arc<UserSession>> {
        self.read().parent.clone()
    }

    /// Whether the JID denotes this connection's account or bound resource.
    pub fn is_user_id(&self, jid: &Jid) -> bool {
        let identity = self.read();
        match &identity.user {
            Some(user) => jid.to_bare() == *user,
            None => false,
        }
    }

    /// Connection-scoped data.
    pub fn data(&self) -> &TypedMap {
        &self.data
    }

    /// Read account-scoped data shared by every connection of the user.
    pub fn get_common<T: std::any::Any + Send + Sync>(
        &self,
        key: &DataKey<T>,
    ) -> Result<Option<Arc<T>>, SmError> {
        Ok(self.parent()?.common().get(key))
    }

    /// Write account-scoped data shared by every connection of the user.
    pub fn put_common<T: std::any::Any + Send + Sync>(
        &self,
        key: &DataKey<T>,
        value: T,
    ) -> Result<Option<Arc<T>>, SmError> {
        Ok(self.parent()?.common().put(key, value))
    }

    /// Get or atomically create account-scoped data.
    pub fn common_or_insert_with<T, F>(&self, key: &DataKey<T>, init: F) -> Result<Arc<T>, SmError>
    where
        T: std::any::Any + Send + Sync,
        F: FnOnce() -> T,
    {
        Ok(self.parent()?.common().get_or_insert_with(key, init))
    }

    /// Other live connections of the same account.
    pub fn active_resources(&self) -> Vec<Arc<ResourceConnection>> {
        match self.user_session() {
            Some(parent) => parent
                .connections()
                .into_iter()
                .filter(|c| c.connection_id() != &self.connection_id)
                .collect(),
            None => Vec::new(),
        }
    }

    fn parent(&self) -> Result<Arc<UserSession>, SmError> {
        self.user_session()
            .ok_or_else(|| SmError::not_authorized("session is not authorized yet"))
    }

    pub(crate) fn attach(&self, user: BareJid, parent: Arc<UserSession>) -> Result<(), SmError> {
        let mut identity = self.write();
        if identity.user.is_some() {
            return Err(SmError::AlreadyAuthorized);
        }
        identity.user = Some(user);
        identity.parent = Some(parent);
        Ok(())
    }

    /// Single assignment of the full JID.
    pub(crate) fn bind(&self, jid: FullJid) -> Result<(), SmError> {
        let mut identity = self.write();
        if identity.user.is_none() {
            return Err(SmError::not_authorized("session is not authorized yet"));
        }
        if let Some(existing) = &identity.jid {
            return Err(SmError::ResourceAlreadyBound(existing.clone()));
        }
        identity.jid = Some(jid);
        Ok(())
    }

    /// Clear identity and connection data; returns the detached parent.
    pub(crate) fn reset(&self) -> Option<Arc<UserSession>> {
        let parent = {
            let mut identity = self.write();
            identity.user = None;
            identity.jid = None;
            identity.parent.take()
        };
        self.data.clear();
        parent
    }

    fn read(&self) -> RwLockReadGuard<'_, Identity> {
        self.identity.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Identity> {
        self.identity.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ResourceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let identity = self.read();
        f.debug_struct("ResourceConnection")
            .field("connection_id", &self.connection_id)
            .field("domain", &self.domain)
            .field("session_id", &self.session_id)
            .field("user", &identity.user)
            .field("jid", &identity.jid)
            .field("data", &self.data)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    const FLAG: DataKey<AtomicBool> = DataKey::new("test-flag");

    fn connection() -> ResourceConnection {
        ResourceConnection::new(Jid::new("c2s@example.com/conn-1").unwrap(), "example.com")
    }

    fn alice() -> BareJid {
        BareJid::new("alice@example.com").unwrap()
    }

    #[test]
    fn test_new_connection_is_unauthenticated() {
        let conn = connection();
        assert_eq!(conn.auth_state(), AuthState::Unauthenticated);
        assert!(!conn.is_authorized());
        assert!(matches!(conn.bare_jid(), Err(SmError::NotAuthorized(_))));
        assert!(matches!(conn.jid(), Err(SmError::NotAuthorized(_))));
        assert!(conn.user_session().is_none());
        assert!(!conn.session_id().is_empty());
    }

    #[test]
    fn test_common_data_requires_authorization() {
        let conn = connection();
        assert!(conn.get_common(&FLAG).is_err());
        assert!(conn.put_common(&FLAG, AtomicBool::new(true)).is_err());
    }

    #[test]
    fn test_state_transitions() {
        let conn = connection();
        let parent = Arc::new(UserSession::new(alice()));
        conn.attach(alice(), parent).unwrap();
        assert_eq!(conn.auth_state(), AuthState::Authenticated);
        assert!(matches!(
            conn.attach(alice(), Arc::new(UserSession::new(alice()))),
            Err(SmError::AlreadyAuthorized)
        ));

        let full = alice().with_resource_str("phone").unwrap();
        conn.bind(full.clone()).unwrap();
        assert_eq!(conn.auth_state(), AuthState::ResourceBound);
        assert_eq!(conn.resource().as_deref(), Some("phone"));

        let again = alice().with_resource_str("laptop").unwrap();
        match conn.bind(again) {
            Err(SmError::ResourceAlreadyBound(existing)) => assert_eq!(existing, full),
            other => panic!("unexpected bind result: {:?}", other),
        }
    }

    #[test]
    fn test_bind_requires_authorization() {
        let conn = connection();
        let full = alice().with_resource_str("phone").unwrap();
        assert!(matches!(conn.bind(full), Err(SmError::NotAuthorized(_))));
    }

    #[test]
    fn test_reset_clears_identity_and_data() {
        let conn = connection();
        conn.attach(alice(), Arc::new(UserSession::new(alice()))).unwrap();
        conn.data().put(&FLAG, AtomicBool::new(true));
        assert!(conn.reset().is_some());
        assert_eq!(conn.auth_state(), AuthState::Unauthenticated);
        assert!(conn.data().is_empty());
    }

    #[test]
    fn test_is_user_id() {
        let conn = connection();
        let jid: Jid = Jid::new("alice@example.com/other").unwrap();
        assert!(!conn.is_user_id(&jid));
        conn.attach(alice(), Arc::new(UserSession::new(alice()))).unwrap();
        assert!(conn.is_user_id(&jid));
        assert!(!conn.is_user_id(&Jid::new("bob@example.com").unwrap()));
    }

    #[test]
    fn test_touch_updates_last_accessed() {
        let conn = connection();
        let before = conn.last_accessed();
        conn.touch();
        assert!(conn.last_accessed() >= before);
    }
}
