//! Processor contract.
//!
//! A processor is described by a [`ProcessorDescriptor`]: its id, the
//! `(element path, namespace)` pairs it claims for main processing, and any
//! of the four phase handlers:
//!
//! | Phase      | Trait             | Runs                                   |
//! |------------|-------------------|----------------------------------------|
//! | preprocess | [`Preprocessor`]  | every packet, before main processing   |
//! | process    | [`Processor`]     | packets matching a claimed path        |
//! | filter     | [`PacketFilter`]  | every result queue, and at teardown    |
//! | stop       | [`StopListener`]  | once per session teardown              |

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use minidom::Element;

use crate::error::SmError;
use crate::packet::{Packet, Results};
use crate::repository::NonAuthUserRepository;
use crate::session::{AuthState, ResourceConnection};
use crate::settings::Settings;

/// Early interception of every inbound packet.
///
/// Returns `Ok(true)` when the packet is fully handled and the pipeline
/// must stop, `Ok(false)` to continue.
pub trait Preprocessor: Send + Sync {
    fn preprocess(
        &self,
        packet: &mut Packet,
        session: Option<&Arc<ResourceConnection>>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        settings: &Settings,
    ) -> Result<bool, SmError>;
}

/// Main feature logic for claimed packets.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        packet: &Packet,
        session: Option<&Arc<ResourceConnection>>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        settings: &Settings,
    ) -> Result<(), SmError>;
}

/// Post-processing over the outbound queue.
///
/// `packet` is `None` when filters run over teardown results. Filters must
/// be idempotent per result item.
pub trait PacketFilter: Send + Sync {
    fn filter(
        &self,
        packet: Option<&Packet>,
        session: Option<&Arc<ResourceConnection>>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        settings: &Settings,
    );
}

/// Session teardown hook, run before logout.
#[async_trait]
pub trait StopListener: Send + Sync {
    async fn stopped(
        &self,
        session: &Arc<ResourceConnection>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        settings: &Settings,
    ) -> Result<(), SmError>;
}

/// Element name path plus namespace claimed by a processor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementPath {
    path: Vec<String>,
    xmlns: String,
}

impl ElementPath {
    pub fn new<S: AsRef<str>>(path: &[S], xmlns: impl Into<String>) -> Self {
        Self {
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            xmlns: xmlns.into(),
        }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn xmlns(&self) -> &str {
        &self.xmlns
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.path {
            write!(f, "/{}", name)?;
        }
        write!(f, "[{}]", self.xmlns)
    }
}

/// When a stream feature is advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureVisibility {
    /// Before authentication only
    PreAuth,
    /// After authentication, until a resource is bound
    PostAuthUnbound,
    /// Once a resource is bound
    Bound,
    /// At every stage
    Always,
}

impl FeatureVisibility {
    pub fn visible_in(&self, state: AuthState) -> bool {
        match self {
            Self::PreAuth => state == AuthState::Unauthenticated,
            Self::PostAuthUnbound => state == AuthState::Authenticated,
            Self::Bound => state == AuthState::ResourceBound,
            Self::Always => true,
        }
    }
}

/// Threading requirement declared by a processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueHint {
    /// Any worker may run the processor
    #[default]
    Shared,
    /// Packets of one session must be handled in order by one worker
    PerSession,
}

/// Static description of a processor and its phase handlers.
#[derive(Clone)]
pub struct ProcessorDescriptor {
    id: String,
    handles: Vec<ElementPath>,
    preprocessor: Option<Arc<dyn Preprocessor>>,
    processor: Option<Arc<dyn Processor>>,
    filter: Option<Arc<dyn PacketFilter>>,
    stop_listener: Option<Arc<dyn StopListener>>,
    stream_features: Vec<(Element, FeatureVisibility)>,
    disco_features: Vec<String>,
    queue_hint: QueueHint,
}

impl ProcessorDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handles: Vec::new(),
            preprocessor: None,
            processor: None,
            filter: None,
            stop_listener: None,
            stream_features: Vec::new(),
            disco_features: Vec::new(),
            queue_hint: QueueHint::Shared,
        }
    }

    /// Claim an element path and namespace for main processing.
    pub fn handles<S: AsRef<str>>(mut self, path: &[S], xmlns: &str) -> Self {
        self.handles.push(ElementPath::new(path, xmlns));
        self
    }

    pub fn preprocessor(mut self, handler: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = Some(handler);
        self
    }

    pub fn processor(mut self, handler: Arc<dyn Processor>) -> Self {
        self.processor = Some(handler);
        self
    }

    pub fn filter(mut self, handler: Arc<dyn PacketFilter>) -> Self {
        self.filter = Some(handler);
        self
    }

    pub fn stop_listener(mut self, handler: Arc<dyn StopListener>) -> Self {
        self.stop_listener = Some(handler);
        self
    }

    pub fn stream_feature(mut self, feature: Element, visibility: FeatureVisibility) -> Self {
        self.stream_features.push((feature, visibility));
        self
    }

    pub fn disco_feature(mut self, feature: impl Into<String>) -> Self {
        self.disco_features.push(feature.into());
        self
    }

    pub fn queue_hint(mut self, hint: QueueHint) -> Self {
        self.queue_hint = hint;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handled_paths(&self) -> &[ElementPath] {
        &self.handles
    }

    pub fn get_preprocessor(&self) -> Option<&Arc<dyn Preprocessor>> {
        self.preprocessor.as_ref()
    }

    pub fn get_processor(&self) -> Option<&Arc<dyn Processor>> {
        self.processor.as_ref()
    }

    pub fn get_filter(&self) -> Option<&Arc<dyn PacketFilter>> {
        self.filter.as_ref()
    }

    pub fn get_stop_listener(&self) -> Option<&Arc<dyn StopListener>> {
        self.stop_listener.as_ref()
    }

    /// Stream features visible in the given state.
    pub fn stream_features(&self, state: AuthState) -> impl Iterator<Item = &Element> {
        self.stream_features
            .iter()
            .filter(move |(_, visibility)| visibility.visible_in(state))
            .map(|(feature, _)| feature)
    }

    pub fn disco_features(&self) -> &[String] {
        &self.disco_features
    }

    pub fn get_queue_hint(&self) -> QueueHint {
        self.queue_hint
    }
}

impl fmt::Debug for ProcessorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorDescriptor")
            .field("id", &self.id)
            .field("handles", &self.handles)
            .field("preprocessor", &self.preprocessor.is_some())
            .field("processor", &self.processor.is_some())
            .field("filter", &self.filter.is_some())
            .field("stop_listener", &self.stop_listener.is_some())
            .field("queue_hint", &self.queue_hint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ns;

    #[test]
    fn test_element_path_display() {
        let path = ElementPath::new(&["iq", "query"], ns::IQ_AUTH);
        assert_eq!(path.to_string(), "/iq/query[jabber:iq:auth]");
    }

    #[test]
    fn test_feature_visibility() {
        assert!(FeatureVisibility::PreAuth.visible_in(AuthState::Unauthenticated));
        assert!(!FeatureVisibility::PreAuth.visible_in(AuthState::Authenticated));
        assert!(FeatureVisibility::PostAuthUnbound.visible_in(AuthState::Authenticated));
        assert!(!FeatureVisibility::Bound.visible_in(AuthState::Authenticated));
        assert!(FeatureVisibility::Always.visible_in(AuthState::ResourceBound));
    }

    #[test]
    fn test_descriptor_features() {
        let descriptor = ProcessorDescriptor::new("legacy-auth")
            .handles(&["iq", "query"], ns::IQ_AUTH)
            .stream_feature(
                Element::builder("auth", ns::IQ_AUTH_FEATURE).build(),
                FeatureVisibility::PreAuth,
            )
            .disco_feature(ns::IQ_AUTH);

        assert_eq!(descriptor.id(), "legacy-auth");
        assert_eq!(descriptor.handled_paths().len(), 1);
        assert_eq!(descriptor.stream_features(AuthState::Unauthenticated).count(), 1);
        assert_eq!(descriptor.stream_features(AuthState::ResourceBound).count(), 0);
        assert_eq!(descriptor.disco_features(), &[ns::IQ_AUTH.to_string()]);
        assert_eq!(descriptor.get_queue_hint(), QueueHint::Shared);
    }
}
