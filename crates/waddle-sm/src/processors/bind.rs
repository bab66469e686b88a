//! Resource binding: RFC 6120 `<bind/>`, the RFC 3921 `<session/>` no-op and
//! XEP-0386 Bind2.
//!
//! Bind2 requests run an [`InlineChain`] so that features enabled inline
//! (carbons, CSI) take effect before the `<bound/>` reply is sent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jid::Jid;
use minidom::{Element, Node};
use tracing::{debug, info, instrument};

use crate::chain::{InlineChain, InlineStep, StepOutcome};
use crate::error::{SmError, StanzaErrorCondition};
use crate::packet::{ns, Packet, Results, StanzaType};
use crate::processor::{FeatureVisibility, Processor, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::{DataKey, ResourceConnection, SessionRegistry};
use crate::settings::Settings;

use super::{csi, error_reply};

pub const ID: &str = "bind";

const CARBONS_KEY: DataKey<AtomicBool> = DataKey::new("carbons-enabled");

/// Whether message carbons were enabled on the connection.
pub fn carbons_enabled(session: &ResourceConnection) -> bool {
    session
        .data()
        .get(&CARBONS_KEY)
        .is_some_and(|flag| flag.load(Ordering::Acquire))
}

/// Bind2 inline step for `<enable xmlns='urn:xmpp:carbons:2'/>`.
#[derive(Debug, Default)]
pub struct CarbonsOnBind;

#[async_trait]
impl InlineStep for CarbonsOnBind {
    fn id(&self) -> &str {
        ns::CARBONS
    }

    async fn run(
        &self,
        session: &Arc<ResourceConnection>,
        request: &Element,
        _response: &mut Vec<Element>,
    ) -> Result<StepOutcome, SmError> {
        if request.get_child("enable", ns::CARBONS).is_some() {
            session
                .data()
                .get_or_insert_with(&CARBONS_KEY, || AtomicBool::new(false))
                .store(true, Ordering::Release);
            debug!(connection_id = %session.connection_id(), "Carbons enabled on bind");
        }
        Ok(StepOutcome::Continue)
    }
}

/// Bind2 `<bind/>` advertisement for the SASL2 `<inline/>` features.
pub fn bind2_inline_feature() -> Element {
    let inline = Element::builder("inline", ns::BIND2)
        .append(Element::builder("feature", ns::BIND2).attr("var", ns::CARBONS).build())
        .append(Element::builder("feature", ns::BIND2).attr("var", ns::CSI).build())
        .build();
    Element::builder("bind", ns::BIND2).append(inline).build()
}

pub struct Bind {
    sessions: Arc<SessionRegistry>,
    inline: InlineChain,
}

impl Bind {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self {
            sessions,
            inline: InlineChain::new()
                .then(Arc::new(CarbonsOnBind))
                .then(Arc::new(csi::InactiveOnBind)),
        }
    }

    fn bound(jid: &jid::FullJid) -> Element {
        Element::builder("bind", ns::BIND)
            .append(
                Element::builder("jid", ns::BIND)
                    .append(Node::Text(jid.to_string()))
                    .build(),
            )
            .build()
    }

    fn bind(&self, packet: &Packet, session: &Arc<ResourceConnection>, results: &mut Results) {
        if packet.stanza_type() != Some(StanzaType::Set) {
            if let Some(error) = error_reply(
                packet,
                StanzaErrorCondition::BadRequest,
                "Bind type is incorrect",
                false,
            ) {
                results.offer(error);
            }
            return;
        }

        let requested = packet.child_text(&["iq", "bind", "resource"]);
        match self.sessions.bind_resource(session, requested.as_deref()) {
            Ok(jid) | Err(SmError::ResourceAlreadyBound(jid)) => {
                results.offer(packet.ok_result(Some(Self::bound(&jid))));
            }
            Err(e) => {
                debug!(error = %e, "Resource binding failed");
                if let Some(error) = error_reply(packet, e.condition(), &e.to_string(), false) {
                    results.offer(error);
                }
            }
        }
    }

    fn session(packet: &Packet, session: &ResourceConnection, results: &mut Results) {
        let reply = if session.is_authorized() {
            Some(packet.ok_result(None))
        } else {
            error_reply(
                packet,
                StanzaErrorCondition::NotAuthorized,
                "Session is not authorized",
                false,
            )
        };
        results.extend(reply);
    }

    #[instrument(skip_all, fields(connection_id = %session.connection_id()))]
    async fn bind2(
        &self,
        packet: &Packet,
        session: &Arc<ResourceConnection>,
        results: &mut Results,
    ) -> Result<(), SmError> {
        let request = packet.element();
        let tag = request
            .get_child("tag", ns::BIND2)
            .map(Element::text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        let resource = match tag {
            Some(tag) => format!("{}.{}", tag, &uuid::Uuid::new_v4().simple().to_string()[..8]),
            None => self.sessions.generate_resource(),
        };
        let jid = match self.sessions.bind_resource(session, Some(&resource)) {
            Ok(jid) | Err(SmError::ResourceAlreadyBound(jid)) => jid,
            Err(e) => {
                debug!(error = %e, "Bind2 failed");
                results.extend(error_reply(packet, e.condition(), &e.to_string(), false));
                return Ok(());
            }
        };
        info!(jid = %jid, "Bound via Bind2");

        let mut payload = Vec::new();
        self.inline.run(session, request, &mut payload).await?;

        let bound = Element::builder("bound", ns::BIND2).append_all(payload).build();
        let mut reply = Packet::new(bound)?.with_packet_to(session.connection_id().clone());
        reply.init_vars(None, Some(Jid::from(jid)));
        results.offer(reply);
        Ok(())
    }
}

#[async_trait]
impl Processor for Bind {
    async fn process(
        &self,
        packet: &Packet,
        session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        _settings: &Settings,
    ) -> Result<(), SmError> {
        let Some(session) = session else {
            return Ok(());
        };

        if packet.elem_name() == "bind" {
            return self.bind2(packet, session, results).await;
        }
        if packet.element_at_path(&["iq", "session"]).is_some() {
            Self::session(packet, session, results);
            return Ok(());
        }
        self.bind(packet, session, results);
        Ok(())
    }
}

pub fn descriptor(sessions: Arc<SessionRegistry>) -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID)
        .handles(&["iq", "bind"], ns::BIND)
        .handles(&["iq", "session"], ns::SESSION)
        .handles(&["bind"], ns::BIND2)
        .processor(Arc::new(Bind::new(sessions)))
        .stream_feature(
            Element::builder("bind", ns::BIND).build(),
            FeatureVisibility::PostAuthUnbound,
        )
        .stream_feature(
            Element::builder("session", ns::SESSION)
                .append(Element::builder("optional", ns::SESSION).build())
                .build(),
            FeatureVisibility::PostAuthUnbound,
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, NonAuthRepository};
    use jid::BareJid;

    struct Fixture {
        sessions: Arc<SessionRegistry>,
        session: Arc<ResourceConnection>,
        bind: Bind,
        repo: NonAuthRepository,
    }

    fn conn_id() -> Jid {
        Jid::new("c2s@example.com/conn-1").unwrap()
    }

    fn fixture(authorized: bool) -> Fixture {
        let sessions = Arc::new(SessionRegistry::new("example.com", "t"));
        let session = sessions.open(conn_id(), None);
        if authorized {
            sessions
                .authorize(&session, BareJid::new("alice@example.com").unwrap())
                .unwrap();
        }
        Fixture {
            bind: Bind::new(Arc::clone(&sessions)),
            sessions,
            session,
            repo: NonAuthRepository::new(Arc::new(MemoryRepository::new())),
        }
    }

    fn packet(xml: &str) -> Packet {
        Packet::from_connection(xml.parse().unwrap(), &conn_id()).unwrap()
    }

    async fn run(f: &Fixture, packet: &Packet) -> Results {
        let mut results = Results::new();
        f.bind
            .process(packet, Some(&f.session), &f.repo, &mut results, &Settings::default())
            .await
            .unwrap();
        results
    }

    fn bound_jid(results: &Results) -> Option<String> {
        results
            .front()?
            .element()
            .get_child("bind", ns::BIND)?
            .get_child("jid", ns::BIND)
            .map(Element::text)
    }

    #[tokio::test]
    async fn test_bind_requested_resource() {
        let f = fixture(true);
        let request = packet(
            "<iq xmlns='jabber:client' type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>desk</resource></bind></iq>",
        );
        let results = run(&f, &request).await;
        assert_eq!(bound_jid(&results).as_deref(), Some("alice@example.com/desk"));
        assert_eq!(results.front().unwrap().packet_to(), Some(&conn_id()));
    }

    #[tokio::test]
    async fn test_second_bind_returns_existing() {
        let f = fixture(true);
        let first = packet(
            "<iq xmlns='jabber:client' type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>",
        );
        let jid = bound_jid(&run(&f, &first).await).unwrap();
        let second = packet(
            "<iq xmlns='jabber:client' type='set' id='b2'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><resource>other</resource></bind></iq>",
        );
        assert_eq!(bound_jid(&run(&f, &second).await), Some(jid));
        assert_eq!(f.sessions.resources_for(&BareJid::new("alice@example.com").unwrap()).len(), 1);
    }

    #[tokio::test]
    async fn test_bind_unauthorized_fails() {
        let f = fixture(false);
        let request = packet(
            "<iq xmlns='jabber:client' type='set' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></iq>",
        );
        let results = run(&f, &request).await;
        assert_eq!(results.errors().count(), 1);
        assert!(!f.session.is_resource_bound());
    }

    #[tokio::test]
    async fn test_session_is_noop() {
        let f = fixture(true);
        let request = packet(
            "<iq xmlns='jabber:client' type='set' id='s1'><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></iq>",
        );
        let results = run(&f, &request).await;
        assert_eq!(results.front().unwrap().stanza_type(), Some(StanzaType::Result));
    }

    #[tokio::test]
    async fn test_bind2_runs_inline_steps() {
        let f = fixture(true);
        let request = packet(
            "<bind xmlns='urn:xmpp:bind:0'><tag>phone</tag><enable xmlns='urn:xmpp:carbons:2'/><inactive xmlns='urn:xmpp:csi:0'/></bind>",
        );
        let results = run(&f, &request).await;
        let reply = results.front().unwrap();
        assert!(reply.element().is("bound", ns::BIND2));
        assert!(f.session.resource().unwrap().starts_with("phone."));
        assert!(carbons_enabled(&f.session));
        assert!(csi::state(&f.session).is_inactive());
    }

    #[tokio::test]
    async fn test_bind2_unauthorized_replies_with_error() {
        let f = fixture(false);
        let request = packet(
            "<bind xmlns='urn:xmpp:bind:0'><tag>phone</tag><enable xmlns='urn:xmpp:carbons:2'/></bind>",
        );
        let results = run(&f, &request).await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results.front().unwrap().error_condition(),
            Some(StanzaErrorCondition::NotAuthorized)
        );
        assert!(!f.session.is_resource_bound());
        assert!(!carbons_enabled(&f.session));
    }

    #[test]
    fn test_inline_feature_lists_steps() {
        let feature = bind2_inline_feature();
        let vars: Vec<&str> = feature
            .get_child("inline", ns::BIND2)
            .unwrap()
            .children()
            .filter_map(|c| c.attr("var"))
            .collect();
        assert_eq!(vars, vec![ns::CARBONS, ns::CSI]);
    }
}
