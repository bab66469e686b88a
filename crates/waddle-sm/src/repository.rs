//! Storage seams consumed by the pipeline.
//!
//! Three views are used:
//!
//! - [`UserRepository`]: account-scoped durable data, available to
//!   processors running for authenticated sessions.
//! - [`NonAuthUserRepository`]: the restricted view handed to every phase,
//!   exposing only public data, offline data and per-domain scratch data.
//! - [`AuthRepository`]: credential checks and account lifecycle.
//!
//! [`MemoryRepository`] implements the first and last for tests and
//! single-node embedding; [`NonAuthRepository`] derives the restricted view
//! from any [`UserRepository`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use jid::BareJid;
use tracing::debug;

use crate::error::SmError;

/// Account-scoped durable key/value storage.
///
/// Values are addressed by `(user, subnode, key)`; a key holds a list of
/// strings, with single-value accessors reading and writing the first one.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn user_exists(&self, user: &BareJid) -> Result<bool, SmError>;

    /// Create an empty account, failing with [`SmError::UserExists`].
    async fn add_user(&self, user: &BareJid) -> Result<(), SmError>;

    /// Delete an account and all its data, failing with [`SmError::UserNotFound`].
    async fn remove_user(&self, user: &BareJid) -> Result<(), SmError>;

    async fn get_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError>;

    async fn get_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Vec<String>, SmError>;

    async fn set_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SmError>;

    async fn set_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        values: &[String],
    ) -> Result<(), SmError>;

    async fn remove_data(&self, user: &BareJid, subnode: &str, key: &str) -> Result<(), SmError>;
}

/// Data reachable without authenticating as the account owner.
#[async_trait]
pub trait NonAuthUserRepository: Send + Sync {
    /// Publicly readable data; [`SmError::UserNotFound`] for unknown accounts.
    async fn get_public_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError>;

    async fn get_offline_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError>;

    async fn get_offline_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Vec<String>, SmError>;

    /// Store offline data; never overwrites an existing value.
    async fn add_offline_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SmError>;

    /// Append values to an offline list.
    async fn add_offline_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        values: &[String],
    ) -> Result<(), SmError>;

    async fn get_domain_temp_data(
        &self,
        domain: &str,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError>;

    async fn put_domain_temp_data(
        &self,
        domain: &str,
        subnode: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SmError>;
}

/// Credentials and account lifecycle.
#[async_trait]
pub trait AuthRepository: Send + Sync {
    /// Check a plain-text password. Unknown accounts fail with
    /// [`SmError::UserNotFound`].
    async fn plain_auth(&self, user: &BareJid, password: &str) -> Result<bool, SmError>;

    async fn add_user(&self, user: &BareJid, password: &str) -> Result<(), SmError>;

    async fn update_password(&self, user: &BareJid, password: &str) -> Result<(), SmError>;

    async fn remove_user(&self, user: &BareJid) -> Result<(), SmError>;

    /// SASL-style mechanism names this repository can verify.
    fn mechanisms(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
struct UserRecord {
    password: Option<String>,
    data: HashMap<String, Vec<String>>,
}

fn data_key(subnode: &str, key: &str) -> String {
    format!("{}/{}", subnode, key)
}

/// In-memory user and credential store.
#[derive(Default)]
pub struct MemoryRepository {
    users: DashMap<BareJid, UserRecord>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRepository")
            .field("users", &self.users.len())
            .finish()
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn user_exists(&self, user: &BareJid) -> Result<bool, SmError> {
        Ok(self.users.contains_key(user))
    }

    async fn add_user(&self, user: &BareJid) -> Result<(), SmError> {
        match self.users.entry(user.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SmError::UserExists(user.clone())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(UserRecord::default());
                debug!(user = %user, "User created");
                Ok(())
            }
        }
    }

    async fn remove_user(&self, user: &BareJid) -> Result<(), SmError> {
        self.users
            .remove(user)
            .map(|_| debug!(user = %user, "User removed"))
            .ok_or_else(|| SmError::UserNotFound(user.clone()))
    }

    async fn get_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError> {
        Ok(self
            .get_data_list(user, subnode, key)
            .await?
            .into_iter()
            .next())
    }

    async fn get_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Vec<String>, SmError> {
        let record = self
            .users
            .get(user)
            .ok_or_else(|| SmError::UserNotFound(user.clone()))?;
        Ok(record
            .data
            .get(&data_key(subnode, key))
            .cloned()
            .unwrap_or_default())
    }

    async fn set_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SmError> {
        self.set_data_list(user, subnode, key, &[value.to_string()])
            .await
    }

    async fn set_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        values: &[String],
    ) -> Result<(), SmError> {
        let mut record = self
            .users
            .get_mut(user)
            .ok_or_else(|| SmError::UserNotFound(user.clone()))?;
        record.data.insert(data_key(subnode, key), values.to_vec());
        Ok(())
    }

    async fn remove_data(&self, user: &BareJid, subnode: &str, key: &str) -> Result<(), SmError> {
        let mut record = self
            .users
            .get_mut(user)
            .ok_or_else(|| SmError::UserNotFound(user.clone()))?;
        record.data.remove(&data_key(subnode, key));
        Ok(())
    }
}

#[async_trait]
impl AuthRepository for MemoryRepository {
    async fn plain_auth(&self, user: &BareJid, password: &str) -> Result<bool, SmError> {
        let record = self
            .users
            .get(user)
            .ok_or_else(|| SmError::UserNotFound(user.clone()))?;
        Ok(record.password.as_deref() == Some(password))
    }

    async fn add_user(&self, user: &BareJid, password: &str) -> Result<(), SmError> {
        match self.users.entry(user.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SmError::UserExists(user.clone())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(UserRecord {
                    password: Some(password.to_string()),
                    data: HashMap::new(),
                });
                debug!(user = %user, "Account registered");
                Ok(())
            }
        }
    }

    async fn update_password(&self, user: &BareJid, password: &str) -> Result<(), SmError> {
        let mut record = self
            .users
            .get_mut(user)
            .ok_or_else(|| SmError::UserNotFound(user.clone()))?;
        record.password = Some(password.to_string());
        Ok(())
    }

    async fn remove_user(&self, user: &BareJid) -> Result<(), SmError> {
        UserRepository::remove_user(self, user).await
    }

    fn mechanisms(&self) -> Vec<String> {
        vec!["PLAIN".to_string()]
    }
}

/// Restricted view over a [`UserRepository`].
///
/// Public data lives under `public/<subnode>`, offline data under
/// `offline/<subnode>` and domain scratch data under `temp/<subnode>` of a
/// pseudo-account named after the domain.
#[derive(Clone)]
pub struct NonAuthRepository {
    repo: Arc<dyn UserRepository>,
}

impl NonAuthRepository {
    const PUBLIC: &'static str = "public";
    const OFFLINE: &'static str = "offline";
    const TEMP: &'static str = "temp";

    pub fn new(repo: Arc<dyn UserRepository>) -> Self {
        Self { repo }
    }

    fn subnode(prefix: &str, subnode: &str) -> String {
        if subnode.is_empty() {
            prefix.to_string()
        } else {
            format!("{}/{}", prefix, subnode)
        }
    }

    async fn existing(&self, user: &BareJid) -> Result<(), SmError> {
        if self.repo.user_exists(user).await? {
            Ok(())
        } else {
            Err(SmError::UserNotFound(user.clone()))
        }
    }

    async fn domain_account(&self, domain: &str) -> Result<BareJid, SmError> {
        let account = BareJid::new(domain)?;
        if !self.repo.user_exists(&account).await? {
            match self.repo.add_user(&account).await {
                Ok(()) | Err(SmError::UserExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(account)
    }
}

impl fmt::Debug for NonAuthRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonAuthRepository").finish_non_exhaustive()
    }
}

#[async_trait]
impl NonAuthUserRepository for NonAuthRepository {
    async fn get_public_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError> {
        self.existing(user).await?;
        self.repo
            .get_data(user, &Self::subnode(Self::PUBLIC, subnode), key)
            .await
    }

    async fn get_offline_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError> {
        self.existing(user).await?;
        self.repo
            .get_data(user, &Self::subnode(Self::OFFLINE, subnode), key)
            .await
    }

    async fn get_offline_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
    ) -> Result<Vec<String>, SmError> {
        self.existing(user).await?;
        self.repo
            .get_data_list(user, &Self::subnode(Self::OFFLINE, subnode), key)
            .await
    }

    async fn add_offline_data(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SmError> {
        self.existing(user).await?;
        let node = Self::subnode(Self::OFFLINE, subnode);
        if self.repo.get_data(user, &node, key).await?.is_some() {
            return Err(SmError::storage(format!(
                "offline data {}/{} already exists for {}",
                node, key, user
            )));
        }
        self.repo.set_data(user, &node, key, value).await
    }

    async fn add_offline_data_list(
        &self,
        user: &BareJid,
        subnode: &str,
        key: &str,
        values: &[String],
    ) -> Result<(), SmError> {
        self.existing(user).await?;
        let node = Self::subnode(Self::OFFLINE, subnode);
        let mut list = self.repo.get_data_list(user, &node, key).await?;
        list.extend_from_slice(values);
        self.repo.set_data_list(user, &node, key, &list).await
    }

    async fn get_domain_temp_data(
        &self,
        domain: &str,
        subnode: &str,
        key: &str,
    ) -> Result<Option<String>, SmError> {
        let account = BareJid::new(domain)?;
        if !self.repo.user_exists(&account).await? {
            return Ok(None);
        }
        self.repo
            .get_data(&account, &Self::subnode(Self::TEMP, subnode), key)
            .await
    }

    async fn put_domain_temp_data(
        &self,
        domain: &str,
        subnode: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SmError> {
        let account = self.domain_account(domain).await?;
        self.repo
            .set_data(&account, &Self::subnode(Self::TEMP, subnode), key, value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> BareJid {
        BareJid::new("alice@example.com").unwrap()
    }

    fn repos() -> (Arc<MemoryRepository>, NonAuthRepository) {
        let memory = Arc::new(MemoryRepository::new());
        let non_auth = NonAuthRepository::new(memory.clone());
        (memory, non_auth)
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let repo = MemoryRepository::new();
        let users: &dyn UserRepository = &repo;
        users.add_user(&alice()).await.unwrap();
        assert!(users.user_exists(&alice()).await.unwrap());
        assert!(matches!(
            users.add_user(&alice()).await,
            Err(SmError::UserExists(_))
        ));

        users.set_data(&alice(), "roster", "count", "3").await.unwrap();
        assert_eq!(
            users.get_data(&alice(), "roster", "count").await.unwrap().as_deref(),
            Some("3")
        );
        users.remove_data(&alice(), "roster", "count").await.unwrap();
        assert!(users.get_data(&alice(), "roster", "count").await.unwrap().is_none());

        users.remove_user(&alice()).await.unwrap();
        assert!(matches!(
            users.get_data(&alice(), "roster", "count").await,
            Err(SmError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_plain_auth() {
        let repo = MemoryRepository::new();
        let auth: &dyn AuthRepository = &repo;
        auth.add_user(&alice(), "secret").await.unwrap();
        assert!(auth.plain_auth(&alice(), "secret").await.unwrap());
        assert!(!auth.plain_auth(&alice(), "wrong").await.unwrap());

        auth.update_password(&alice(), "changed").await.unwrap();
        assert!(auth.plain_auth(&alice(), "changed").await.unwrap());

        let bob = BareJid::new("bob@example.com").unwrap();
        assert!(matches!(
            auth.plain_auth(&bob, "x").await,
            Err(SmError::UserNotFound(_))
        ));
        assert_eq!(auth.mechanisms(), vec!["PLAIN".to_string()]);
    }

    #[tokio::test]
    async fn test_public_data_is_namespaced() {
        let (memory, non_auth) = repos();
        let users: &dyn UserRepository = memory.as_ref();
        users.add_user(&alice()).await.unwrap();
        users
            .set_data(&alice(), "public/jabber:iq:last", "last-time", "1000")
            .await
            .unwrap();

        assert_eq!(
            non_auth
                .get_public_data(&alice(), "jabber:iq:last", "last-time")
                .await
                .unwrap()
                .as_deref(),
            Some("1000")
        );
        let bob = BareJid::new("bob@example.com").unwrap();
        assert!(matches!(
            non_auth.get_public_data(&bob, "x", "y").await,
            Err(SmError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_data_never_overwritten() {
        let (memory, non_auth) = repos();
        let users: &dyn UserRepository = memory.as_ref();
        users.add_user(&alice()).await.unwrap();

        non_auth.add_offline_data(&alice(), "msgs", "first", "a").await.unwrap();
        assert!(non_auth.add_offline_data(&alice(), "msgs", "first", "b").await.is_err());
        assert_eq!(
            non_auth.get_offline_data(&alice(), "msgs", "first").await.unwrap().as_deref(),
            Some("a")
        );

        non_auth
            .add_offline_data_list(&alice(), "msgs", "queue", &["1".to_string()])
            .await
            .unwrap();
        non_auth
            .add_offline_data_list(&alice(), "msgs", "queue", &["2".to_string(), "3".to_string()])
            .await
            .unwrap();
        assert_eq!(
            non_auth.get_offline_data_list(&alice(), "msgs", "queue").await.unwrap(),
            vec!["1", "2", "3"]
        );
    }

    #[tokio::test]
    async fn test_domain_temp_data() {
        let (_, non_auth) = repos();
        assert!(non_auth
            .get_domain_temp_data("example.com", "register", "count")
            .await
            .unwrap()
            .is_none());
        non_auth
            .put_domain_temp_data("example.com", "register", "count", "1")
            .await
            .unwrap();
        assert_eq!(
            non_auth
                .get_domain_temp_data("example.com", "register", "count")
                .await
                .unwrap()
                .as_deref(),
            Some("1")
        );
    }
}
