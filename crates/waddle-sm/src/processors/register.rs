//! XEP-0077: In-Band Registration.
//!
//! Unauthenticated connections may create an account; authenticated ones may
//! change their password or remove the account. Requests from unauthenticated
//! connections and removals are subject to:
//!
//! - the `registration-whitelist` / `registration-blacklist` settings, lists
//!   of addresses or CIDR ranges matched against the remote address;
//! - the domain-wide enable flag;
//! - a token bucket per remote address.
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0077.html>

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use jid::{BareJid, Jid};
use minidom::{Element, Node};
use tracing::{debug, info, instrument, warn};

use crate::error::{SmError, StanzaErrorCondition};
use crate::packet::{ns, Packet, Priority, Results, StanzaType};
use crate::processor::{FeatureVisibility, Processor, ProcessorDescriptor};
use crate::rate_limit::TokenBucketPool;
use crate::repository::{AuthRepository, NonAuthUserRepository, UserRepository};
use crate::session::{ResourceConnection, SessionRegistry};
use crate::settings::Settings;

use super::{error_reply, Collaborators};

pub const ID: &str = ns::IQ_REGISTER;

const DEFAULT_INSTRUCTIONS: &str =
    "Choose a user name and password for use with this service.Please provide also your e-mail address.";

const EMAIL_SUBNODE: &str = "registration";
const EMAIL_KEY: &str = "email";

const DEFAULT_REMOTE: &str = "<default>";

/// Address or CIDR range from the white/black list settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddressRule {
    network: IpAddr,
    prefix: u8,
}

impl AddressRule {
    fn parse(value: &str) -> Option<Self> {
        let (addr, prefix) = match value.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix.parse::<u8>().ok()?)),
            None => (value.trim(), None),
        };
        let network: IpAddr = addr.parse().ok()?;
        let max = if network.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        (prefix <= max).then_some(Self { network, prefix })
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn parse_ip(remote: &str) -> Option<IpAddr> {
    remote
        .parse::<SocketAddr>()
        .map(|s| s.ip())
        .or_else(|_| remote.parse::<IpAddr>())
        .ok()
}

fn rules(settings: &Settings, key: &str) -> Vec<AddressRule> {
    settings
        .get_str_list(key)
        .iter()
        .filter_map(|value| {
            let rule = AddressRule::parse(value);
            if rule.is_none() {
                warn!(key, value = %value, "Ignoring malformed address rule");
            }
            rule
        })
        .collect()
}

pub struct Register {
    sessions: Arc<SessionRegistry>,
    users: Arc<dyn UserRepository>,
    auth: Arc<dyn AuthRepository>,
    limiter: Arc<TokenBucketPool>,
    enabled: bool,
}

impl Register {
    pub fn new(collaborators: &Collaborators, enabled: bool) -> Self {
        Self {
            sessions: Arc::clone(&collaborators.sessions),
            users: Arc::clone(&collaborators.users),
            auth: Arc::clone(&collaborators.auth),
            limiter: Arc::clone(&collaborators.registration_limiter),
            enabled,
        }
    }

    /// Key for the rate limiter: the remote address, or the host part
    /// encoded in the connection id (`<local>_<port>_<host>_...`).
    fn remote_key(session: &ResourceConnection) -> String {
        if let Some(remote) = session.remote_address() {
            return parse_ip(remote).map_or_else(|| remote.to_string(), |ip| ip.to_string());
        }
        session
            .connection_id()
            .resource()
            .and_then(|r| r.as_str().split('_').nth(2).map(str::to_string))
            .unwrap_or_else(|| DEFAULT_REMOTE.to_string())
    }

    fn remote_allowed(session: &ResourceConnection, settings: &Settings) -> bool {
        let whitelist = rules(settings, "registration-whitelist");
        let blacklist = rules(settings, "registration-blacklist");
        if whitelist.is_empty() && blacklist.is_empty() {
            return true;
        }
        let Some(ip) = session.remote_address().and_then(parse_ip) else {
            return whitelist.is_empty();
        };
        if !whitelist.is_empty() && !whitelist.iter().any(|r| r.matches(ip)) {
            return false;
        }
        !blacklist.iter().any(|r| r.matches(ip))
    }

    fn form(packet: &Packet, session: &ResourceConnection, settings: &Settings) -> Element {
        let instructions = settings
            .get_str("instructions")
            .unwrap_or(DEFAULT_INSTRUCTIONS);
        let mut query = Element::builder("query", ns::IQ_REGISTER)
            .append(
                Element::builder("instructions", ns::IQ_REGISTER)
                    .append(Node::Text(instructions.to_string()))
                    .build(),
            )
            .append(Element::builder("username", ns::IQ_REGISTER).build())
            .append(Element::builder("password", ns::IQ_REGISTER).build())
            .append(Element::builder("email", ns::IQ_REGISTER).build());
        if session.is_authorized() {
            query = query.append(Element::builder("registered", ns::IQ_REGISTER).build());
        }
        debug!(packet = %packet, "Sending registration form");
        query.build()
    }

    async fn remove(&self, packet: &Packet, session: &Arc<ResourceConnection>, results: &mut Results) {
        let children = packet
            .element_at_path(&["iq", "query"])
            .map_or(0, |q| q.children().count());
        if children > 1 {
            results.extend(error_reply(
                packet,
                StanzaErrorCondition::BadRequest,
                "Remove request must not carry other fields",
                false,
            ));
            return;
        }
        let user = match session.bare_jid() {
            Ok(user) => user,
            Err(_) => {
                results.extend(error_reply(
                    packet,
                    StanzaErrorCondition::NotAuthorized,
                    "You must authorize session first.",
                    false,
                ));
                return;
            }
        };

        match self.auth.remove_user(&user).await {
            Ok(()) | Err(SmError::UserNotFound(_)) => {
                info!(user = %user, "Account removed");
                results.offer(packet.ok_result(None).with_priority(Priority::System));
                results.offer(
                    Packet::close_command(session.connection_id()).with_priority(Priority::Low),
                );
                self.sessions.logout(session);
            }
            Err(e) => self.storage_failure(packet, &e, results),
        }
    }

    async fn register(&self, packet: &Packet, session: &Arc<ResourceConnection>, results: &mut Results) {
        let field = |name: &str| {
            packet
                .child_text(&["iq", "query", name])
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let Some(password) = field("password") else {
            results.extend(error_reply(
                packet,
                StanzaErrorCondition::NotAcceptable,
                "Password is required.",
                false,
            ));
            return;
        };

        if let Ok(user) = session.bare_jid() {
            match self.auth.update_password(&user, &password).await {
                Ok(()) => {
                    info!(user = %user, "Password changed");
                    results.offer(packet.ok_result(None));
                }
                Err(e) => self.storage_failure(packet, &e, results),
            }
            return;
        }

        let username = field("username").unwrap_or_default();
        let user = match BareJid::new(&format!("{}@{}", username, session.domain())) {
            Ok(user) if !username.is_empty() => user,
            _ => {
                results.extend(error_reply(
                    packet,
                    StanzaErrorCondition::JidMalformed,
                    "Incorrect user name, stringprep processing failed.",
                    false,
                ));
                return;
            }
        };

        if let Err(e) = self.auth.add_user(&user, &password).await {
            match e {
                SmError::UserExists(_) => results.extend(error_reply(
                    packet,
                    StanzaErrorCondition::Conflict,
                    "Unsuccessful registration attempt",
                    false,
                )),
                e => self.storage_failure(packet, &e, results),
            }
            return;
        }
        if let Some(email) = field("email") {
            if let Err(e) = self.users.set_data(&user, EMAIL_SUBNODE, EMAIL_KEY, &email).await {
                warn!(user = %user, error = %e, "Storing registration e-mail failed");
            }
        }
        info!(user = %user, "Account registered");
        results.offer(packet.ok_result(None));
    }

    fn storage_failure(&self, packet: &Packet, error: &SmError, results: &mut Results) {
        warn!(error = %error, "Repository access exception");
        results.extend(error_reply(
            packet,
            StanzaErrorCondition::InternalServerError,
            "Database access problem, please contact administrator.",
            false,
        ));
    }

    /// Checks applied to unauthenticated requests and removals.
    fn admit(&self, packet: &Packet, session: &ResourceConnection, settings: &Settings) -> Option<Packet> {
        if !Self::remote_allowed(session, settings) {
            debug!(remote = ?session.remote_address(), "Registration from a disallowed address");
            return error_reply(
                packet,
                StanzaErrorCondition::NotAllowed,
                "Registration is not allowed for this connection.",
                false,
            );
        }
        if !self.enabled {
            return error_reply(
                packet,
                StanzaErrorCondition::NotAllowed,
                "Registration is not allowed for this domain.",
                false,
            );
        }
        if !self.limiter.consume(&Self::remote_key(session)) {
            return error_reply(
                packet,
                StanzaErrorCondition::ResourceConstraint,
                "Server is busy. Too many registrations. Try later.",
                false,
            );
        }
        None
    }
}

#[async_trait]
impl Processor for Register {
    #[instrument(skip_all, fields(packet = %packet))]
    async fn process(
        &self,
        packet: &Packet,
        session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        settings: &Settings,
    ) -> Result<(), SmError> {
        let Some(session) = session else {
            return Ok(());
        };

        let domain = BareJid::new(session.domain())?;
        let id = packet.stanza_to().map_or_else(|| domain.clone(), Jid::to_bare);
        let own = packet.packet_from() == Some(session.connection_id());
        let for_us = !session.is_authorized() || session.is_user_id(&Jid::from(id.clone())) || id == domain;

        if !(own && for_us) {
            let mut copy = packet.copy_element_only();
            if packet.stanza_to().is_some_and(|to| session.is_user_id(to)) {
                copy.set_packet_to(Some(session.connection_id().clone()));
            }
            results.offer(copy);
            return Ok(());
        }

        let remove = packet.element_at_path(&["iq", "query", "remove"]).is_some();
        if !session.is_authorized() || remove {
            if let Some(error) = self.admit(packet, session, settings) {
                results.offer(error);
                return Ok(());
            }
        }

        match packet.stanza_type() {
            Some(StanzaType::Set) if remove => self.remove(packet, session, results).await,
            Some(StanzaType::Set) => self.register(packet, session, results).await,
            Some(StanzaType::Get) => {
                results.offer(packet.ok_result(Some(Self::form(packet, session, settings))));
            }
            Some(StanzaType::Result) => {
                let mut copy = packet.copy_element_only();
                copy.set_packet_to(Some(session.connection_id().clone()));
                results.offer(copy);
            }
            _ => results.extend(error_reply(
                packet,
                StanzaErrorCondition::BadRequest,
                "Message type is incorrect",
                false,
            )),
        }
        Ok(())
    }
}

/// Registration processor; advertises its features only when `enabled`.
pub fn descriptor(collaborators: &Collaborators, enabled: bool) -> ProcessorDescriptor {
    let descriptor = ProcessorDescriptor::new(ID)
        .handles(&["iq", "query"], ns::IQ_REGISTER)
        .processor(Arc::new(Register::new(collaborators, enabled)));
    if !enabled {
        return descriptor;
    }
    descriptor
        .stream_feature(
            Element::builder("register", ns::IQ_REGISTER_FEATURE).build(),
            FeatureVisibility::PreAuth,
        )
        .disco_feature(ns::IQ_REGISTER)
}
