//! Processor registry and `(path, namespace)` index.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use minidom::Element;
use tracing::debug;

use crate::error::SmError;
use crate::packet::Packet;
use crate::processor::{
    ElementPath, PacketFilter, Preprocessor, ProcessorDescriptor, StopListener,
};
use crate::session::AuthState;

/// Registered processors, in registration order.
///
/// The registry is built once at startup and shared immutably afterwards.
#[derive(Default)]
pub struct ProcessorRegistry {
    descriptors: Vec<ProcessorDescriptor>,
    ids: HashMap<String, usize>,
    index: HashMap<ElementPath, usize>,
    max_depth: usize,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor. Duplicate ids or claimed paths are rejected.
    pub fn register(&mut self, descriptor: ProcessorDescriptor) -> Result<(), SmError> {
        if self.ids.contains_key(descriptor.id()) {
            return Err(SmError::config(format!(
                "processor '{}' registered twice",
                descriptor.id()
            )));
        }
        for path in descriptor.handled_paths() {
            if let Some(&other) = self.index.get(path) {
                let owner = self
                    .descriptors
                    .get(other)
                    .map(ProcessorDescriptor::id)
                    .unwrap_or("?");
                return Err(SmError::config(format!(
                    "{} claimed by both '{}' and '{}'",
                    path,
                    owner,
                    descriptor.id()
                )));
            }
        }

        let position = self.descriptors.len();
        for path in descriptor.handled_paths() {
            self.max_depth = self.max_depth.max(path.path().len());
            self.index.insert(path.clone(), position);
        }
        self.ids.insert(descriptor.id().to_string(), position);
        debug!(
            processor = %descriptor.id(),
            paths = descriptor.handled_paths().len(),
            "Processor registered"
        );
        self.descriptors.push(descriptor);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, descriptor: ProcessorDescriptor) -> Result<Self, SmError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<&ProcessorDescriptor> {
        self.ids.get(id).and_then(|&i| self.descriptors.get(i))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(ProcessorDescriptor::id)
    }

    /// Main processor for a packet.
    ///
    /// Walks the packet's element tree up to the deepest registered path
    /// and returns the processor claiming the longest matching path; ties go
    /// to the first match in document order.
    pub fn lookup(&self, packet: &Packet) -> Option<&ProcessorDescriptor> {
        let mut best: Option<(usize, usize)> = None;
        let mut path = Vec::with_capacity(self.max_depth);
        self.walk(packet.element(), &mut path, &mut best);
        best.and_then(|(_, i)| self.descriptors.get(i))
    }

    fn walk<'a>(
        &self,
        element: &'a Element,
        path: &mut Vec<&'a str>,
        best: &mut Option<(usize, usize)>,
    ) {
        path.push(element.name());
        let key = ElementPath::new(path.as_slice(), element.ns());
        if let Some(&i) = self.index.get(&key) {
            if best.map_or(true, |(depth, _)| path.len() > depth) {
                *best = Some((path.len(), i));
            }
        }
        if path.len() < self.max_depth {
            for child in element.children() {
                self.walk(child, path, best);
            }
        }
        path.pop();
    }

    pub fn preprocessors(&self) -> impl Iterator<Item = (&str, &Arc<dyn Preprocessor>)> {
        self.descriptors
            .iter()
            .filter_map(|d| d.get_preprocessor().map(|p| (d.id(), p)))
    }

    pub fn filters(&self) -> impl Iterator<Item = (&str, &Arc<dyn PacketFilter>)> {
        self.descriptors
            .iter()
            .filter_map(|d| d.get_filter().map(|f| (d.id(), f)))
    }

    pub fn stop_listeners(&self) -> impl Iterator<Item = (&str, &Arc<dyn StopListener>)> {
        self.descriptors
            .iter()
            .filter_map(|d| d.get_stop_listener().map(|s| (d.id(), s)))
    }

    /// Stream features advertised to a session in the given state.
    pub fn stream_features(&self, state: AuthState) -> Vec<Element> {
        self.descriptors
            .iter()
            .flat_map(|d| d.stream_features(state))
            .cloned()
            .collect()
    }

    /// Sorted, de-duplicated disco features of all processors.
    pub fn disco_features(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .flat_map(|d| d.disco_features().iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("processors", &self.ids().collect::<Vec<_>>())
            .field("paths", &self.index.len())
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ns;

    fn packet(xml: &str) -> Packet {
        Packet::new(xml.parse().unwrap()).unwrap()
    }

    fn registry() -> ProcessorRegistry {
        ProcessorRegistry::new()
            .with(ProcessorDescriptor::new("message").handles(&["message"], ns::JABBER_CLIENT))
            .unwrap()
            .with(ProcessorDescriptor::new("auth").handles(&["iq", "query"], ns::IQ_AUTH))
            .unwrap()
            .with(
                ProcessorDescriptor::new("csi")
                    .handles(&["active"], ns::CSI)
                    .handles(&["inactive"], ns::CSI),
            )
            .unwrap()
    }

    #[test]
    fn test_lookup_by_path_and_namespace() {
        let registry = registry();
        let auth = packet("<iq xmlns='jabber:client' type='get' id='1'><query xmlns='jabber:iq:auth'/></iq>");
        assert_eq!(registry.lookup(&auth).map(|d| d.id()), Some("auth"));

        let other_ns = packet("<iq xmlns='jabber:client' type='get' id='1'><query xmlns='jabber:iq:roster'/></iq>");
        assert!(registry.lookup(&other_ns).is_none());

        let inactive = packet("<inactive xmlns='urn:xmpp:csi:0'/>");
        assert_eq!(registry.lookup(&inactive).map(|d| d.id()), Some("csi"));
    }

    #[test]
    fn test_longest_path_wins() {
        let registry = registry()
            .with(
                ProcessorDescriptor::new("receipts").handles(&["message", "request"], "urn:xmpp:receipts"),
            )
            .unwrap();
        let plain = packet("<message xmlns='jabber:client' to='bob@example.com'><body>hi</body></message>");
        assert_eq!(registry.lookup(&plain).map(|d| d.id()), Some("message"));

        let receipt = packet(
            "<message xmlns='jabber:client' to='bob@example.com'><body>hi</body><request xmlns='urn:xmpp:receipts'/></message>",
        );
        assert_eq!(registry.lookup(&receipt).map(|d| d.id()), Some("receipts"));
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut registry = registry();
        assert!(matches!(
            registry.register(ProcessorDescriptor::new("auth")),
            Err(SmError::Config(_))
        ));
        assert!(matches!(
            registry.register(ProcessorDescriptor::new("auth2").handles(&["iq", "query"], ns::IQ_AUTH)),
            Err(SmError::Config(_))
        ));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_features_collected() {
        let registry = ProcessorRegistry::new()
            .with(
                ProcessorDescriptor::new("a")
                    .disco_feature("urn:b")
                    .disco_feature("urn:a")
                    .stream_feature(
                        Element::builder("auth", ns::IQ_AUTH_FEATURE).build(),
                        crate::processor::FeatureVisibility::PreAuth,
                    ),
            )
            .unwrap()
            .with(ProcessorDescriptor::new("b").disco_feature("urn:a"))
            .unwrap();
        assert_eq!(registry.disco_features(), vec!["urn:a", "urn:b"]);
        assert_eq!(registry.stream_features(AuthState::Unauthenticated).len(), 1);
        assert!(registry.stream_features(AuthState::ResourceBound).is_empty());
    }
}
