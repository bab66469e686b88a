//! XEP-0030 disco#info for the server, and intake of disco#info results for
//! entity capabilities nodes.
//!
//! Results for a hashed caps node (`node#ver` where `ver` is a base64 SHA-1)
//! are stored only when the verification string computed from the payload
//! matches `ver`. Legacy nodes are stored as received.
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0030.html>
//! - <https://xmpp.org/extensions/xep-0115.html#ver-gen>

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use minidom::Element;
use tracing::{debug, warn};

use crate::caps::{disco_features, verification_from_disco, CapsCache};
use crate::error::SmError;
use crate::packet::{ns, Packet, Results, StanzaType};
use crate::processor::{Processor, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::ResourceConnection;
use crate::settings::Settings;

pub const ID: &str = "disco";

/// Length of a base64-encoded SHA-1 digest.
const SHA1_BASE64_LEN: usize = 28;

fn looks_hashed(ver: &str) -> bool {
    ver.len() == SHA1_BASE64_LEN && ver.ends_with('=')
}

pub struct Disco {
    domain: String,
    caps: Arc<CapsCache>,
    features: OnceLock<Vec<String>>,
}

impl Disco {
    pub fn new(domain: &str, caps: Arc<CapsCache>) -> Self {
        Self {
            domain: domain.to_string(),
            caps,
            features: OnceLock::new(),
        }
    }

    /// Set the features the server advertises. Only the first call counts.
    pub fn publish_features(&self, features: Vec<String>) {
        let mut all: BTreeSet<String> = features.into_iter().collect();
        all.insert(ns::DISCO_INFO.to_string());
        if self.features.set(all.into_iter().collect()).is_err() {
            warn!("Disco features already published");
        }
    }

    pub fn features(&self) -> &[String] {
        self.features.get().map(Vec::as_slice).unwrap_or_default()
    }

    fn info(&self, node: Option<&str>) -> Element {
        let mut query = Element::builder("query", ns::DISCO_INFO).append(
            Element::builder("identity", ns::DISCO_INFO)
                .attr("category", "server")
                .attr("type", "im")
                .build(),
        );
        if let Some(node) = node {
            query = query.attr("node", node);
        }
        for feature in self.features() {
            query = query.append(
                Element::builder("feature", ns::DISCO_INFO)
                    .attr("var", feature.as_str())
                    .build(),
            );
        }
        query.build()
    }

    fn addressed_to_server(&self, packet: &Packet) -> bool {
        match packet.stanza_to() {
            None => true,
            Some(to) => to.node().is_none() && to.resource().is_none() && to.domain().as_str() == self.domain,
        }
    }

    /// Store a caps node learnt from a disco#info result.
    fn intake(&self, query: &Element) {
        let Some(node) = query.attr("node") else {
            return;
        };
        let Some((_, ver)) = node.rsplit_once('#') else {
            return;
        };
        if self.caps.contains(node) {
            return;
        }
        if looks_hashed(ver) {
            let computed = verification_from_disco(query);
            if computed != ver {
                warn!(node, computed = %computed, "Caps verification mismatch, not caching");
                return;
            }
        }
        self.caps.put(node, disco_features(query));
    }
}

#[async_trait]
impl Processor for Disco {
    async fn process(
        &self,
        packet: &Packet,
        _session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        _settings: &Settings,
    ) -> Result<(), SmError> {
        let Some(query) = packet.element_at_path(&["iq", "query"]) else {
            return Ok(());
        };
        match packet.stanza_type() {
            Some(StanzaType::Get) if self.addressed_to_server(packet) => {
                results.offer(packet.ok_result(Some(self.info(query.attr("node")))));
            }
            Some(StanzaType::Get) => {
                debug!(packet = %packet, "Forwarding disco#info query");
                results.offer(packet.copy_element_only());
            }
            Some(StanzaType::Result) => self.intake(query),
            _ => {}
        }
        Ok(())
    }
}

pub fn descriptor(disco: Arc<Disco>) -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID)
        .handles(&["iq", "query"], ns::DISCO_INFO)
        .processor(disco)
        .disco_feature(ns::DISCO_INFO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, NonAuthRepository};

    fn disco() -> (Disco, Arc<CapsCache>) {
        let caps = Arc::new(CapsCache::new());
        let disco = Disco::new("example.com", Arc::clone(&caps));
        disco.publish_features(vec![ns::CSI.to_string(), ns::LAST.to_string()]);
        (disco, caps)
    }

    async fn run(disco: &Disco, xml: &str) -> Results {
        let packet = Packet::new(xml.parse().unwrap()).unwrap();
        let repo = NonAuthRepository::new(Arc::new(MemoryRepository::new()));
        let mut results = Results::new();
        disco
            .process(&packet, None, &repo, &mut results, &Settings::default())
            .await
            .unwrap();
        results
    }

    #[tokio::test]
    async fn test_server_info() {
        let (disco, _) = disco();
        let results = run(
            &disco,
            "<iq xmlns='jabber:client' type='get' id='d1' from='alice@example.com/phone' to='example.com'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        )
        .await;
        let query = results.front().unwrap().element().get_child("query", ns::DISCO_INFO).unwrap().clone();
        let identity = query.get_child("identity", ns::DISCO_INFO).unwrap();
        assert_eq!(identity.attr("category"), Some("server"));
        assert_eq!(
            disco_features(&query),
            vec![ns::DISCO_INFO.to_string(), ns::LAST.to_string(), ns::CSI.to_string()]
        );
    }

    #[tokio::test]
    async fn test_verified_caps_stored() {
        let (disco, caps) = disco();
        run(
            &disco,
            "<iq xmlns='jabber:client' type='result' id='c1'>\
             <query xmlns='http://jabber.org/protocol/disco#info' node='http://code.google.com/p/exodus#QgayPKawpkPSDYmwT/WM94uAlu0='>\
             <identity category='client' type='pc' name='Exodus 0.9.1'/>\
             <feature var='http://jabber.org/protocol/caps'/>\
             <feature var='http://jabber.org/protocol/disco#info'/>\
             <feature var='http://jabber.org/protocol/disco#items'/>\
             <feature var='http://jabber.org/protocol/muc'/>\
             </query></iq>",
        )
        .await;
        assert_eq!(
            caps.nodes_with_feature("http://jabber.org/protocol/muc"),
            vec!["http://code.google.com/p/exodus#QgayPKawpkPSDYmwT/WM94uAlu0="]
        );
    }

    #[tokio::test]
    async fn test_mismatched_caps_rejected() {
        let (disco, caps) = disco();
        run(
            &disco,
            "<iq xmlns='jabber:client' type='result' id='c1'>\
             <query xmlns='http://jabber.org/protocol/disco#info' node='http://client.test#AAAAAAAAAAAAAAAAAAAAAAAAAAA='>\
             <feature var='urn:xmpp:spoofed'/>\
             </query></iq>",
        )
        .await;
        assert!(caps.is_empty());

        run(
            &disco,
            "<iq xmlns='jabber:client' type='result' id='c2'>\
             <query xmlns='http://jabber.org/protocol/disco#info' node='http://client.test#0.11'>\
             <feature var='urn:xmpp:legacy'/>\
             </query></iq>",
        )
        .await;
        assert!(caps.contains("http://client.test#0.11"));
    }

    #[tokio::test]
    async fn test_query_to_user_forwarded() {
        let (disco, _) = disco();
        let results = run(
            &disco,
            "<iq xmlns='jabber:client' type='get' id='d2' to='bob@example.com/desk'><query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        )
        .await;
        assert_eq!(results.front().unwrap().type_attr(), Some("get"));
    }
}
