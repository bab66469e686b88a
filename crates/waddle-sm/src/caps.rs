//! XEP-0115: Entity Capabilities cache.
//!
//! Maps caps nodes (`node#ver`) to the features the advertising entity
//! supports, with a reverse index by feature. Components interested in
//! newly learnt nodes can [`subscribe`](CapsCache::subscribe).
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0115.html>

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::error::SmError;
use crate::packet::{ns, Packet};

/// Callback invoked with a node and its features when the node is stored.
pub type CapsListener = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

/// Handle returned by [`CapsCache::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Shared caps node cache.
#[derive(Default)]
pub struct CapsCache {
    nodes: DashMap<String, Arc<[String]>>,
    feature_nodes: DashMap<String, BTreeSet<String>>,
    listeners: DashMap<u64, CapsListener>,
    next_id: AtomicU64,
}

impl CapsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Features of a caps node.
    pub fn get(&self, node: &str) -> Option<Arc<[String]>> {
        self.nodes.get(node).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// Store the features of a node and notify subscribers.
    pub fn put(&self, node: impl Into<String>, features: impl IntoIterator<Item = String>) {
        let node = node.into();
        let features: Arc<[String]> = features
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>()
            .into();

        for feature in features.iter() {
            self.feature_nodes
                .entry(feature.clone())
                .or_default()
                .insert(node.clone());
        }
        debug!(node = %node, features = features.len(), "Caps node stored");
        self.nodes.insert(node.clone(), Arc::clone(&features));

        let listeners: Vec<CapsListener> =
            self.listeners.iter().map(|e| Arc::clone(e.value())).collect();
        for listener in listeners {
            listener(&node, &features[..]);
        }
    }

    /// Nodes known to support a feature.
    pub fn nodes_with_feature(&self, feature: &str) -> Vec<String> {
        self.feature_nodes
            .get(feature)
            .map(|nodes| nodes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Nodes from the list that are not cached yet.
    pub fn unknown<'a>(&self, nodes: &'a [String]) -> Vec<&'a str> {
        nodes
            .iter()
            .filter(|n| !self.contains(n))
            .map(String::as_str)
            .collect()
    }

    pub fn subscribe(&self, listener: CapsListener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, listener);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id.0).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl fmt::Debug for CapsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapsCache")
            .field("nodes", &self.nodes.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Caps nodes advertised by a `<c/>` element.
///
/// Yields `node#ver`, plus `node#ext` for each legacy extension when the
/// element carries no `hash`.
pub fn caps_nodes(c: &Element) -> Vec<String> {
    let Some(node) = c.attr("node") else {
        return Vec::new();
    };
    let mut nodes = BTreeSet::new();
    if let Some(ver) = c.attr("ver") {
        nodes.insert(format!("{}#{}", node, ver));
    }
    if c.attr("hash").is_none() {
        if let Some(ext) = c.attr("ext") {
            for e in ext.split_whitespace() {
                nodes.insert(format!("{}#{}", node, e));
            }
        }
    }
    nodes.into_iter().collect()
}

/// The `<c/>` child of a presence, if any.
pub fn caps_element(presence: &Element) -> Option<&Element> {
    presence.get_child("c", ns::CAPS)
}

/// Build a `<c/>` element advertising a verification string.
pub fn build_caps_element(node: &str, ver: &str) -> Element {
    Element::builder("c", ns::CAPS)
        .attr("hash", "sha-1")
        .attr("node", node)
        .attr("ver", ver)
        .build()
}

/// disco#info request for a caps node.
pub fn caps_query(from: &Jid, to: &Jid, node: &str) -> Result<Packet, SmError> {
    let element = Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "get")
        .attr("id", format!("caps-{}", uuid::Uuid::new_v4().simple()))
        .attr("from", from.to_string())
        .attr("to", to.to_string())
        .append(
            Element::builder("query", ns::DISCO_INFO)
                .attr("node", node)
                .build(),
        )
        .build();
    Packet::new(element)
}

/// Compute the verification string per XEP-0115 Section 5.
///
/// `identities` are already formatted as `category/type/lang/name`.
/// `extension` is an optional `jabber:x:data` form.
pub fn verification_string(
    identities: &[String],
    features: &[String],
    extension: Option<&Element>,
) -> String {
    let mut s = String::new();
    push_sorted(&mut s, identities);
    push_sorted(&mut s, features);

    if let Some(form) = extension {
        let mut form_type = None;
        let mut fields: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for field in form.children().filter(|c| c.name() == "field") {
            let Some(var) = field.attr("var") else {
                continue;
            };
            let values: Vec<String> = field
                .children()
                .filter(|c| c.name() == "value")
                .map(Element::text)
                .collect();
            if var == "FORM_TYPE" {
                form_type = values.into_iter().next();
            } else {
                fields.insert(var, values);
            }
        }
        if let Some(form_type) = form_type {
            s.push_str(&form_type);
            s.push('<');
        }
        for (var, values) in fields {
            s.push_str(var);
            s.push('<');
            push_sorted(&mut s, &values);
        }
    }

    trace!(verification = %s, "Caps verification string");
    let mut hasher = Sha1::new();
    hasher.update(s.as_bytes());
    BASE64.encode(hasher.finalize())
}

fn push_sorted(s: &mut String, values: &[String]) {
    let mut sorted: Vec<&String> = values.iter().collect();
    sorted.sort();
    for value in sorted {
        s.push_str(value);
        s.push('<');
    }
}

/// Features listed in a disco#info query element.
pub fn disco_features(query: &Element) -> Vec<String> {
    query
        .children()
        .filter(|c| c.name() == "feature")
        .filter_map(|c| c.attr("var").map(str::to_string))
        .collect()
}

/// Verification string of a disco#info query element.
pub fn verification_from_disco(query: &Element) -> String {
    let identities: Vec<String> = query
        .children()
        .filter(|c| c.name() == "identity")
        .map(|i| {
            format!(
                "{}/{}/{}/{}",
                i.attr("category").unwrap_or(""),
                i.attr("type").unwrap_or(""),
                i.attr("xml:lang").unwrap_or(""),
                i.attr("name").unwrap_or("")
            )
        })
        .collect();
    let extension = query.get_child("x", "jabber:x:data");
    verification_string(&identities, &disco_features(query), extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_verification_string_simple_example() {
        // XEP-0115 Section 5.2 simple generation example.
        let identities = vec!["client/pc//Exodus 0.9.1".to_string()];
        let features = vec![
            "http://jabber.org/protocol/muc".to_string(),
            "http://jabber.org/protocol/disco#info".to_string(),
            "http://jabber.org/protocol/caps".to_string(),
            "http://jabber.org/protocol/disco#items".to_string(),
        ];
        assert_eq!(
            verification_string(&identities, &features, None),
            "QgayPKawpkPSDYmwT/WM94uAlu0="
        );
    }

    #[test]
    fn test_verification_from_disco_matches_manual() {
        let query: Element = "<query xmlns='http://jabber.org/protocol/disco#info' node='n#v'>\
            <identity category='client' type='pc' name='Exodus 0.9.1'/>\
            <feature var='http://jabber.org/protocol/caps'/>\
            <feature var='http://jabber.org/protocol/disco#info'/>\
            <feature var='http://jabber.org/protocol/disco#items'/>\
            <feature var='http://jabber.org/protocol/muc'/>\
            </query>"
            .parse()
            .unwrap();
        assert_eq!(verification_from_disco(&query), "QgayPKawpkPSDYmwT/WM94uAlu0=");
        assert_eq!(disco_features(&query).len(), 4);
    }

    #[test]
    fn test_caps_nodes() {
        let c: Element = "<c xmlns='http://jabber.org/protocol/caps' hash='sha-1' node='http://psi-im.org' ver='abc='/>"
            .parse()
            .unwrap();
        assert_eq!(caps_nodes(&c), vec!["http://psi-im.org#abc="]);

        let legacy: Element = "<c xmlns='http://jabber.org/protocol/caps' node='http://psi-im.org' ver='0.11' ext='cs ep'/>"
            .parse()
            .unwrap();
        assert_eq!(
            caps_nodes(&legacy),
            vec!["http://psi-im.org#0.11", "http://psi-im.org#cs", "http://psi-im.org#ep"]
        );
    }

    #[test]
    fn test_put_indexes_and_notifies() {
        let cache = CapsCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = cache.subscribe(Arc::new(move |node: &str, features: &[String]| {
            sink.lock().unwrap().push((node.to_string(), features.len()));
        }));

        cache.put(
            "n#1",
            vec!["urn:b".to_string(), "urn:a".to_string(), "urn:a".to_string()],
        );
        assert_eq!(cache.get("n#1").unwrap().as_ref(), &["urn:a".to_string(), "urn:b".to_string()]);
        assert_eq!(cache.nodes_with_feature("urn:a"), vec!["n#1"]);
        assert_eq!(seen.lock().unwrap().as_slice(), &[("n#1".to_string(), 2)]);

        assert!(cache.unsubscribe(id));
        assert!(!cache.unsubscribe(id));
        cache.put("n#2", vec!["urn:a".to_string()]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(cache.nodes_with_feature("urn:a"), vec!["n#1", "n#2"]);

        let wanted = vec!["n#1".to_string(), "n#3".to_string()];
        assert_eq!(cache.unknown(&wanted), vec!["n#3"]);
    }

    #[test]
    fn test_caps_query_shape() {
        let from = Jid::new("example.com").unwrap();
        let to = Jid::new("alice@example.com/phone").unwrap();
        let query = caps_query(&from, &to, "n#v").unwrap();
        assert_eq!(query.type_attr(), Some("get"));
        assert_eq!(
            query.element().get_child("query", ns::DISCO_INFO).and_then(|q| q.attr("node")),
            Some("n#v")
        );
        let c = build_caps_element("n", "v");
        assert_eq!(caps_nodes(&c), vec!["n#v"]);
    }
}
