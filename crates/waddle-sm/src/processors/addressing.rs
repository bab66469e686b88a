//! Sender address sanitizing.
//!
//! Runs after the authorization gate on packets from the session's own
//! connection:
//!
//! - a sender already verified by the server wins over anything the client
//!   wrote;
//! - an authenticated connection without a bound resource may only bind or
//!   negotiate compression;
//! - once bound, `from` is forced to the session's JID (bare for
//!   subscription presences, full otherwise) and a message without `to` is
//!   addressed to the sender's own account.

use std::sync::Arc;

use jid::Jid;
use tracing::{debug, trace};

use crate::error::{SmError, StanzaErrorCondition};
use crate::matcher::{ElementMatcher, MatcherList};
use crate::packet::{ns, Packet, Results};
use crate::processor::{Preprocessor, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::ResourceConnection;
use crate::settings::Settings;

use super::error_reply;

pub const ID: &str = "addressing";

const BIND_FIRST: &str = "You must bind the resource first";

const STANZAS: [&str; 3] = ["message", "presence", "iq"];

#[derive(Debug, Clone)]
pub struct Addressing {
    unbound_allowed: MatcherList,
}

impl Default for Addressing {
    fn default() -> Self {
        Self {
            unbound_allowed: MatcherList::new(vec![
                ElementMatcher::allow(&["iq", "bind"], ns::BIND),
                ElementMatcher::allow(&["bind"], ns::BIND2),
                ElementMatcher::allow::<&str>(&[], ns::COMPRESS),
            ]),
        }
    }
}

impl Addressing {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(packet: &Packet, session: &ResourceConnection) -> Result<Jid, SmError> {
        let subscription = packet.elem_name() == "presence"
            && packet.stanza_type().map_or(false, |t| t.is_subscription());
        if subscription {
            Ok(Jid::from(session.bare_jid()?))
        } else {
            Ok(Jid::from(session.jid()?))
        }
    }
}

impl Preprocessor for Addressing {
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
        if packet.packet_from() != Some(session.connection_id()) {
            return Ok(false);
        }

        if let Some(authorised) = packet.authorised_from().cloned() {
            trace!(from = %authorised, "Using server-authorised sender");
            let to = packet.stanza_to().cloned();
            packet.init_vars(Some(authorised), to);
            return Ok(false);
        }

        if !session.is_authorized() {
            return Ok(false);
        }

        if !session.is_resource_bound() {
            if self.unbound_allowed.is_allowed(packet) {
                return Ok(false);
            }
            debug!(
                connection_id = %session.connection_id(),
                packet = %packet,
                "Stanza before resource binding"
            );
            if let Some(error) =
                error_reply(packet, StanzaErrorCondition::NotAuthorized, BIND_FIRST, true)
            {
                results.offer(error);
            }
            return Ok(true);
        }

        if !STANZAS.contains(&packet.elem_name()) {
            return Ok(false);
        }

        let from = Self::sender_for(packet, session)?;
        let to = match packet.stanza_to() {
            Some(to) => Some(to.clone()),
            None if packet.elem_name() == "message" => Some(Jid::from(session.bare_jid()?)),
            None => None,
        };
        if packet.stanza_from() != Some(&from) || packet.stanza_to() != to.as_ref() {
            trace!(from = %from, "Correcting stanza addresses");
            packet.init_vars(Some(from), to);
        }
        Ok(false)
    }
}

pub fn descriptor() -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID).preprocessor(Arc::new(Addressing::new()))
}
