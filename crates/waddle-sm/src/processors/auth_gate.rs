//! Authorization gate.
//!
//! Stops everything an unauthenticated connection sends except the stream
//! negotiation and account bootstrap stanzas on the allow list. Message and
//! presence stanzas are rejected before the list is consulted.

use std::sync::Arc;

use tracing::debug;

use crate::error::{SmError, StanzaErrorCondition};
use crate::matcher::MatcherList;
use crate::packet::{Packet, Results};
use crate::processor::{Preprocessor, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::ResourceConnection;
use crate::settings::Settings;

use super::error_reply;

pub const ID: &str = "auth-gate";

const AUTH_ONLY_ELEMS: [&str; 2] = ["message", "presence"];

const NOT_AUTHENTICATED: &str =
    "You must authenticate session first, before you can send any message or presence packet.";

#[derive(Debug, Clone)]
pub struct AuthGate {
    allowed: MatcherList,
}

impl AuthGate {
    pub fn new(allowed: MatcherList) -> Self {
        Self { allowed }
    }

    fn reject(&self, packet: &Packet, session: &ResourceConnection, results: &mut Results) {
        debug!(
            connection_id = %session.connection_id(),
            session_id = %session.session_id(),
            packet = %packet,
            "Packet received before the session has been authenticated"
        );
        if let Some(error) =
            error_reply(packet, StanzaErrorCondition::NotAuthorized, NOT_AUTHENTICATED, true)
        {
            results.offer(error);
        }
    }
}

impl Preprocessor for AuthGate {
    fn preprocess(
        &self,
        packet: &mut Packet,
        session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        _settings: &Settings,
    ) -> Result<bool, SmError> {
        let Some(session) = session else {
            return Ok(false);
        };
        if packet.packet_from() != Some(session.connection_id()) || session.is_authorized() {
            return Ok(false);
        }

        if AUTH_ONLY_ELEMS.contains(&packet.elem_name()) || !self.allowed.is_allowed(packet) {
            self.reject(packet, session, results);
            return Ok(true);
        }
        Ok(false)
    }
}

pub fn descriptor(allowed: MatcherList) -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID).preprocessor(Arc::new(AuthGate::new(allowed)))
}
