//! XEP-0078: Non-SASL Authentication.
//!
//! `get` returns the fields the client must fill in; `set` checks the
//! credentials, authorizes the connection and binds the requested resource
//! in one step.
//!
//! ## Failure handling
//!
//! | Situation                         | Response                          |
//! |-----------------------------------|-----------------------------------|
//! | wrong password                    | `not-authorized`, stream closed   |
//! | unknown user, malformed request   | `not-authorized`, closed after retries run out |
//! | already authenticated             | `not-authorized`, stream closed, logout |
//! | other iq types                    | `bad-request`, stream closed      |
//! | storage failure                   | `internal-server-error`           |
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0078.html>

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jid::BareJid;
use minidom::{Element, Node};
use tracing::{debug, info, instrument, warn};

use crate::error::{SmError, StanzaErrorCondition};
use crate::metrics;
use crate::packet::{ns, Packet, Priority, Results, StanzaType};
use crate::processor::{FeatureVisibility, Processor, ProcessorDescriptor};
use crate::repository::{AuthRepository, NonAuthUserRepository};
use crate::session::{DataKey, ResourceConnection, SessionRegistry};
use crate::settings::Settings;

use super::error_reply;

pub const ID: &str = ns::IQ_AUTH;

const MECHANISM: &str = "iq-auth";

const RETRIES_KEY: DataKey<AtomicU32> = DataKey::new("legacy-auth-retries");

pub struct LegacyAuth {
    sessions: Arc<SessionRegistry>,
    auth: Arc<dyn AuthRepository>,
    max_retries: u32,
}

impl LegacyAuth {
    pub fn new(sessions: Arc<SessionRegistry>, auth: Arc<dyn AuthRepository>, max_retries: u32) -> Self {
        Self {
            sessions,
            auth,
            max_retries,
        }
    }

    fn fields(&self, packet: &Packet) -> Element {
        let username = packet
            .child_text(&["iq", "query", "username"])
            .unwrap_or_default();
        let mut query = Element::builder("query", ns::IQ_AUTH).append(
            Element::builder("username", ns::IQ_AUTH)
                .append(Node::Text(username))
                .build(),
        );
        if self.auth.mechanisms().iter().any(|m| m == "PLAIN") {
            query = query.append(Element::builder("password", ns::IQ_AUTH).build());
        }
        query
            .append(Element::builder("resource", ns::IQ_AUTH).build())
            .build()
    }

    fn close(session: &ResourceConnection, results: &mut Results) {
        results.offer(Packet::close_command(session.connection_id()).with_priority(Priority::Low));
    }

    /// Reject a malformed or unknown-user attempt, closing the stream once
    /// retries run out.
    fn retry_or_close(
        &self,
        packet: &Packet,
        session: &ResourceConnection,
        results: &mut Results,
        reason: &str,
    ) {
        if let Some(error) = error_reply(packet, StanzaErrorCondition::NotAuthorized, reason, false) {
            results.offer(error.with_priority(Priority::System));
        }
        let retries = session
            .data()
            .get_or_insert_with(&RETRIES_KEY, || AtomicU32::new(0));
        if retries.load(Ordering::SeqCst) < self.max_retries {
            let n = retries.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(retries = n, "Legacy authentication retry");
        } else {
            debug!("Legacy authentication retries exhausted, closing stream");
            Self::close(session, results);
        }
    }

    fn credentials(packet: &Packet, domain: &str) -> Result<(BareJid, String, Option<String>), SmError> {
        let username = packet
            .child_text(&["iq", "query", "username"])
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SmError::not_authorized("missing username"))?;
        let password = packet
            .child_text(&["iq", "query", "password"])
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SmError::not_authorized("missing password"))?;
        let resource = packet
            .child_text(&["iq", "query", "resource"])
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        let user = BareJid::new(&format!("{}@{}", username, domain))?;
        Ok((user, password, resource))
    }

    #[instrument(skip_all, fields(connection_id = %session.connection_id()))]
    async fn authenticate(
        &self,
        packet: &Packet,
        session: &Arc<ResourceConnection>,
        results: &mut Results,
    ) -> Result<(), SmError> {
        if session.is_authorized() {
            warn!("Second authentication attempt on an authenticated stream");
            if let Some(error) = error_reply(
                packet,
                StanzaErrorCondition::NotAuthorized,
                "Cannot authenticate twice on the same stream.",
                false,
            ) {
                results.offer(error);
            }
            Self::close(session, results);
            self.sessions.logout(session);
            return Ok(());
        }

        let (user, password, resource) = match Self::credentials(packet, session.domain()) {
            Ok(credentials) => credentials,
            Err(e) => {
                debug!(error = %e, "Malformed legacy authentication request");
                metrics::record_auth_attempt(MECHANISM, false);
                self.retry_or_close(packet, session, results, "Authentication failed");
                return Ok(());
            }
        };

        match self.auth.plain_auth(&user, &password).await {
            Ok(true) => {
                self.sessions.authorize(session, user.clone())?;
                let jid = self.sessions.bind_resource(session, resource.as_deref())?;
                metrics::record_auth_attempt(MECHANISM, true);
                info!(jid = %jid, "Legacy authentication succeeded");
                results.offer(packet.ok_result(None));
            }
            Ok(false) => {
                metrics::record_auth_attempt(MECHANISM, false);
                debug!(user = %user, "Legacy authentication failed");
                if let Some(error) = error_reply(
                    packet,
                    StanzaErrorCondition::NotAuthorized,
                    "Authentication failed",
                    false,
                ) {
                    results.offer(error);
                }
                Self::close(session, results);
            }
            Err(SmError::UserNotFound(_)) => {
                metrics::record_auth_attempt(MECHANISM, false);
                debug!(user = %user, "Legacy authentication for unknown user");
                self.retry_or_close(packet, session, results, "Authentication failed");
            }
            Err(e) => {
                warn!(user = %user, error = %e, "Repository access exception");
                if let Some(error) = error_reply(
                    packet,
                    StanzaErrorCondition::InternalServerError,
                    "Database access problem, please contact administrator.",
                    false,
                ) {
                    results.offer(error);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Processor for LegacyAuth {
    async fn process(
        &self,
        packet: &Packet,
        session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        _settings: &Settings,
    ) -> Result<(), SmError> {
        let Some(session) = session else {
            debug!(packet = %packet, "Legacy auth without a session, ignoring");
            return Ok(());
        };

        match packet.stanza_type() {
            Some(StanzaType::Get) => {
                results.offer(packet.ok_result(Some(self.fields(packet))));
                Ok(())
            }
            Some(StanzaType::Set) => self.authenticate(packet, session, results).await,
            _ => {
                if let Some(error) = error_reply(
                    packet,
                    StanzaErrorCondition::BadRequest,
                    "Message type is incorrect",
                    false,
                ) {
                    results.offer(error);
                }
                Self::close(session, results);
                Ok(())
            }
        }
    }
}

pub fn descriptor(
    sessions: Arc<SessionRegistry>,
    auth: Arc<dyn AuthRepository>,
    max_retries: u32,
) -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID)
        .handles(&["iq", "query"], ns::IQ_AUTH)
        .processor(Arc::new(LegacyAuth::new(sessions, auth, max_retries)))
        .stream_feature(
            Element::builder("auth", ns::IQ_AUTH_FEATURE).build(),
            FeatureVisibility::PreAuth,
        )
        .disco_feature(ns::IQ_AUTH)
}
