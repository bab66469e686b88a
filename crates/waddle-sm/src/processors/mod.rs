//! Built-in processors.
//!
//! | Id                    | Phases                         | Feature                  |
//! |-----------------------|--------------------------------|--------------------------|
//! | `auth-gate`           | preprocess                     | authorization gate       |
//! | `addressing`          | preprocess                     | `from`/`to` sanitizing   |
//! | `delivery-error`      | filter                         | internal payload strip   |
//! | `jabber:iq:auth`      | process                        | XEP-0078                 |
//! | `bind`                | process                        | RFC 6120 bind, XEP-0386  |
//! | `jabber:iq:register`  | process                        | XEP-0077                 |
//! | `urn:xmpp:csi:0`      | process, filter                | XEP-0352                 |
//! | `jabber:iq:last`      | preprocess, process, stop      | XEP-0012                 |
//! | `caps`                | preprocess                     | XEP-0115                 |
//! | `disco`               | process                        | XEP-0030                 |
//! | `error-stats`         | filter                         | error counters           |
//!
//! [`standard_registry`] registers them in this order, which is also the
//! order preprocessors and filters run in.

pub mod addressing;
pub mod auth_gate;
pub mod bind;
pub mod caps;
pub mod csi;
pub mod delivery_error;
pub mod disco;
pub mod error_stats;
pub mod last_activity;
pub mod legacy_auth;
pub mod register;

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::caps::CapsCache;
use crate::config::SessionManagerConfig;
use crate::error::{SmError, StanzaErrorCondition};
use crate::packet::Packet;
use crate::rate_limit::TokenBucketPool;
use crate::registry::ProcessorRegistry;
use crate::repository::{AuthRepository, UserRepository};
use crate::session::SessionRegistry;

/// Shared components the built-in processors depend on.
#[derive(Clone)]
pub struct Collaborators {
    pub sessions: Arc<SessionRegistry>,
    pub users: Arc<dyn UserRepository>,
    pub auth: Arc<dyn AuthRepository>,
    pub caps: Arc<CapsCache>,
    pub registration_limiter: Arc<TokenBucketPool>,
}

impl Collaborators {
    /// Wire repositories and sessions, creating the caps cache and the
    /// registration limiter from configuration.
    pub fn new(
        sessions: Arc<SessionRegistry>,
        users: Arc<dyn UserRepository>,
        auth: Arc<dyn AuthRepository>,
        config: &SessionManagerConfig,
    ) -> Self {
        let registration_limiter = Arc::new(TokenBucketPool::new(
            "registration",
            config.registration.rate,
            config.registration.per(),
        ));
        Self {
            sessions,
            users,
            auth,
            caps: Arc::new(CapsCache::new()),
            registration_limiter,
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("sessions", &self.sessions)
            .field("caps", &self.caps)
            .field("registration_limiter", &self.registration_limiter)
            .finish_non_exhaustive()
    }
}

/// Registry with every built-in processor.
pub fn standard_registry(
    config: &SessionManagerConfig,
    collaborators: &Collaborators,
) -> Result<ProcessorRegistry, SmError> {
    let disco = Arc::new(disco::Disco::new(
        collaborators.sessions.domain(),
        Arc::clone(&collaborators.caps),
    ));

    let mut registry = ProcessorRegistry::new()
        .with(auth_gate::descriptor(config.pre_auth_rules()?))?
        .with(addressing::descriptor())?
        .with(delivery_error::descriptor())?
        .with(legacy_auth::descriptor(
            Arc::clone(&collaborators.sessions),
            Arc::clone(&collaborators.auth),
            config.auth.max_retries,
        ))?
        .with(bind::descriptor(Arc::clone(&collaborators.sessions)))?
        .with(register::descriptor(
            collaborators,
            config.registration.enabled,
        ))?
        .with(csi::descriptor(config.csi.strategy, config.csi.max_queue_size))?
        .with(last_activity::descriptor(
            Arc::clone(&collaborators.sessions),
            Arc::clone(&collaborators.users),
        ))?
        .with(caps::descriptor(Arc::clone(&collaborators.caps)))?
        .with(disco::descriptor(Arc::clone(&disco)))?;
    registry.register(error_stats::descriptor())?;

    disco.publish_features(registry.disco_features());
    Ok(registry)
}

/// Error response for `packet`, or `None` when it is an error already.
pub(crate) fn error_reply(
    packet: &Packet,
    condition: StanzaErrorCondition,
    text: &str,
    include_original: bool,
) -> Option<Packet> {
    match packet.error_result(condition, Some(text), include_original) {
        Ok(error) => Some(error),
        Err(_) => {
            trace!(packet = %packet, "Not answering error packet with an error");
            None
        }
    }
}
