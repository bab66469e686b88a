//! XEP-0352: Client State Indication.
//!
//! Clients announce `<active/>`/`<inactive/>`. While a connection is
//! inactive the filter holds back traffic the [`CsiLogic`] selected by
//! configuration deems deferrable. The queue keeps only the latest stanza
//! per sender and is flushed on overflow, on activation, and ahead of any
//! stanza that is delivered immediately.
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0352.html>

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use minidom::Element;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::chain::{InlineStep, StepOutcome};
use crate::error::SmError;
use crate::packet::{ns, Packet, Results, StanzaType};
use crate::processor::{FeatureVisibility, PacketFilter, Processor, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::{DataKey, ResourceConnection};
use crate::settings::Settings;

pub const ID: &str = ns::CSI;

const STATE_KEY: DataKey<CsiState> = DataKey::new("csi-state");

/// Deferral strategy for inactive clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CsiStrategy {
    /// Hold back available/unavailable presence
    #[default]
    PresenceQueue,
    /// Deliver everything immediately
    Passthrough,
}

impl CsiStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PresenceQueue => "presence-queue",
            Self::Passthrough => "passthrough",
        }
    }

    /// Instantiate the strategy.
    pub fn build(&self) -> Arc<dyn CsiLogic> {
        match self {
            Self::PresenceQueue => Arc::new(PresenceQueue),
            Self::Passthrough => Arc::new(Passthrough),
        }
    }
}

impl fmt::Display for CsiStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CsiStrategy {
    type Err = SmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "presence-queue" => Ok(Self::PresenceQueue),
            "passthrough" => Ok(Self::Passthrough),
            other => Err(SmError::config(format!("unknown CSI strategy '{}'", other))),
        }
    }
}

/// Decides which outbound stanzas may wait while the client is inactive.
pub trait CsiLogic: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_queue(&self, packet: &Packet) -> bool;
}

/// Queues presence broadcasts, latest per sender.
#[derive(Debug, Default)]
pub struct PresenceQueue;

impl CsiLogic for PresenceQueue {
    fn name(&self) -> &'static str {
        "presence-queue"
    }

    fn should_queue(&self, packet: &Packet) -> bool {
        packet.elem_name() == "presence"
            && matches!(
                packet.stanza_type(),
                Some(StanzaType::Available) | Some(StanzaType::Unavailable)
            )
    }
}

#[derive(Debug, Default)]
pub struct Passthrough;

impl CsiLogic for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn should_queue(&self, _packet: &Packet) -> bool {
        false
    }
}

/// Per-connection indication state and deferred stanzas.
#[derive(Default)]
pub struct CsiState {
    inactive: AtomicBool,
    queue: Mutex<VecDeque<Packet>>,
}

impl CsiState {
    pub fn is_inactive(&self) -> bool {
        self.inactive.load(Ordering::Acquire)
    }

    pub fn set_inactive(&self, inactive: bool) {
        self.inactive.store(inactive, Ordering::Release);
    }

    pub fn queued(&self) -> usize {
        self.lock().len()
    }

    /// Queue a packet, replacing an earlier one from the same sender.
    /// Returns the queue length.
    fn push(&self, packet: Packet) -> usize {
        let mut queue = self.lock();
        queue.retain(|p| p.stanza_from() != packet.stanza_from());
        queue.push_back(packet);
        queue.len()
    }

    fn drain(&self) -> VecDeque<Packet> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Packet>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for CsiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsiState")
            .field("inactive", &self.is_inactive())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Indication state of a connection, created on first use.
pub fn state(session: &ResourceConnection) -> Arc<CsiState> {
    session.data().get_or_insert_with(&STATE_KEY, CsiState::default)
}

pub struct Csi {
    logic: Arc<dyn CsiLogic>,
    max_queue_size: usize,
}

impl Csi {
    pub fn new(strategy: CsiStrategy, max_queue_size: usize) -> Self {
        Self {
            logic: strategy.build(),
            max_queue_size: max_queue_size.max(1),
        }
    }

    fn max_queue_size(&self, settings: &Settings) -> usize {
        settings
            .get_i64("max-queue-size")
            .and_then(|n| usize::try_from(n).ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.max_queue_size)
    }

    fn target(
        session: &Arc<ResourceConnection>,
        packet: &Packet,
    ) -> Option<Arc<ResourceConnection>> {
        let to = packet.packet_to()?;
        if to == session.connection_id() {
            return Some(Arc::clone(session));
        }
        session
            .active_resources()
            .into_iter()
            .find(|c| c.connection_id() == to)
    }
}

impl fmt::Debug for Csi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Csi")
            .field("logic", &self.logic.name())
            .field("max_queue_size", &self.max_queue_size)
            .finish()
    }
}

fn mark_flushed(queue: VecDeque<Packet>) -> impl Iterator<Item = Packet> {
    queue.into_iter().map(|mut p| {
        p.processed(ID);
        p
    })
}

#[async_trait]
impl Processor for Csi {
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
        if !session.is_resource_bound() {
            debug!(connection_id = %session.connection_id(), "CSI before resource binding, ignoring");
            return Ok(());
        }

        let state = state(session);
        match packet.elem_name() {
            "inactive" => {
                state.set_inactive(true);
                debug!(connection_id = %session.connection_id(), "Client inactive");
            }
            "active" => {
                state.set_inactive(false);
                let queued = state.drain();
                debug!(
                    connection_id = %session.connection_id(),
                    flushed = queued.len(),
                    "Client active"
                );
                results.extend(mark_flushed(queued));
            }
            other => trace!(element = other, "Unexpected CSI element"),
        }
        Ok(())
    }
}

impl PacketFilter for Csi {
    fn filter(
        &self,
        _packet: Option<&Packet>,
        session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        settings: &Settings,
    ) {
        let Some(session) = session else {
            return;
        };
        if !session.is_authorized() || results.is_empty() {
            return;
        }
        let max_queue_size = self.max_queue_size(settings);

        let mut out = VecDeque::with_capacity(results.len());
        for packet in results.take() {
            if packet.was_processed_by(ID) {
                out.push_back(packet);
                continue;
            }
            let Some(target) = Self::target(session, &packet) else {
                out.push_back(packet);
                continue;
            };
            let state = state(&target);
            if !state.is_inactive() {
                out.extend(mark_flushed(state.drain()));
                out.push_back(packet);
                continue;
            }

            if self.logic.should_queue(&packet) {
                trace!(packet = %packet, "Queueing for inactive client");
                if state.push(packet) > max_queue_size {
                    debug!(connection_id = %target.connection_id(), "CSI queue overflow, flushing");
                    out.extend(mark_flushed(state.drain()));
                }
            } else {
                out.extend(mark_flushed(state.drain()));
                out.push_back(packet);
            }
        }
        results.extend(out);
    }
}

/// Bind2 inline step: `<inactive xmlns='urn:xmpp:csi:0'/>` starts the
/// session inactive.
#[derive(Debug, Default)]
pub struct InactiveOnBind;

#[async_trait]
impl InlineStep for InactiveOnBind {
    fn id(&self) -> &str {
        ID
    }

    async fn run(
        &self,
        session: &Arc<ResourceConnection>,
        request: &Element,
        _response: &mut Vec<Element>,
    ) -> Result<StepOutcome, SmError> {
        if request.get_child("inactive", ns::CSI).is_some() {
            state(session).set_inactive(true);
            debug!(connection_id = %session.connection_id(), "Bound inactive");
        }
        Ok(StepOutcome::Continue)
    }
}

pub fn descriptor(strategy: CsiStrategy, max_queue_size: usize) -> ProcessorDescriptor {
    let csi = Arc::new(Csi::new(strategy, max_queue_size));
    ProcessorDescriptor::new(ID)
        .handles(&["active"], ns::CSI)
        .handles(&["inactive"], ns::CSI)
        .processor(csi.clone())
        .filter(csi)
        .stream_feature(
            Element::builder("csi", ns::CSI).build(),
            FeatureVisibility::PostAuthUnbound,
        )
        .disco_feature(ns::CSI)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, NonAuthRepository};
    use crate::session::SessionRegistry;
    use jid::{BareJid, Jid};

    struct Fixture {
        session: Arc<ResourceConnection>,
        repo: NonAuthRepository,
        csi: Csi,
    }

    fn conn_id() -> Jid {
        Jid::new("c2s@example.com/conn-1").unwrap()
    }

    fn fixture(strategy: CsiStrategy, max: usize) -> Fixture {
        let registry = SessionRegistry::new("example.com", "t");
        let session = registry.open(conn_id(), None);
        registry
            .authorize(&session, BareJid::new("alice@example.com").unwrap())
            .unwrap();
        registry.bind_resource(&session, Some("phone")).unwrap();
        Fixture {
            session,
            repo: NonAuthRepository::new(Arc::new(MemoryRepository::new())),
            csi: Csi::new(strategy, max),
        }
    }

    fn outbound(xml: &str) -> Packet {
        Packet::new(xml.parse().unwrap())
            .unwrap()
            .with_packet_to(conn_id())
    }

    fn presence_from(who: &str) -> Packet {
        outbound(&format!("<presence xmlns='jabber:client' from='{}'/>", who))
    }

    fn filter(f: &Fixture, results: &mut Results) {
        f.csi
            .filter(None, Some(&f.session), &f.repo, results, &Settings::default());
    }

    #[test]
    fn test_strategy_parse_and_display() {
        assert_eq!("presence-queue".parse::<CsiStrategy>().unwrap(), CsiStrategy::PresenceQueue);
        assert_eq!(" Passthrough ".parse::<CsiStrategy>().unwrap(), CsiStrategy::Passthrough);
        assert!("mobile".parse::<CsiStrategy>().is_err());
        assert_eq!(CsiStrategy::default().to_string(), "presence-queue");
        assert_eq!(CsiStrategy::Passthrough.build().name(), "passthrough");
    }

    #[test]
    fn test_active_session_delivers() {
        let f = fixture(CsiStrategy::PresenceQueue, 10);
        let mut results = Results::new();
        results.offer(presence_from("bob@example.com/a"));
        filter(&f, &mut results);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_inactive_queues_latest_presence_per_sender() {
        let f = fixture(CsiStrategy::PresenceQueue, 10);
        state(&f.session).set_inactive(true);

        let mut results = Results::new();
        results.offer(presence_from("bob@example.com/a"));
        results.offer(presence_from("carol@example.com/b"));
        results.offer(presence_from("bob@example.com/a"));
        filter(&f, &mut results);
        assert!(results.is_empty());
        assert_eq!(state(&f.session).queued(), 2);
    }

    #[test]
    fn test_message_flushes_queue_first() {
        let f = fixture(CsiStrategy::PresenceQueue, 10);
        state(&f.session).set_inactive(true);

        let mut results = Results::new();
        results.offer(presence_from("bob@example.com/a"));
        results.offer(outbound("<message xmlns='jabber:client' from='bob@example.com/a'/>"));
        filter(&f, &mut results);

        let names: Vec<&str> = results.iter().map(Packet::elem_name).collect();
        assert_eq!(names, vec!["presence", "message"]);
        assert_eq!(state(&f.session).queued(), 0);

        // Flushed packets are not queued again.
        filter(&f, &mut results);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_overflow_flushes() {
        let f = fixture(CsiStrategy::PresenceQueue, 2);
        state(&f.session).set_inactive(true);
        let mut results = Results::new();
        for who in ["a@example.com/1", "b@example.com/1", "c@example.com/1"] {
            results.offer(presence_from(who));
        }
        filter(&f, &mut results);
        assert_eq!(results.len(), 3);
        assert_eq!(state(&f.session).queued(), 0);
    }

    #[test]
    fn test_passthrough_never_queues() {
        let f = fixture(CsiStrategy::Passthrough, 10);
        state(&f.session).set_inactive(true);
        let mut results = Results::new();
        results.offer(presence_from("bob@example.com/a"));
        filter(&f, &mut results);
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_active_flushes_queue() {
        let f = fixture(CsiStrategy::PresenceQueue, 10);
        let inactive =
            Packet::from_connection("<inactive xmlns='urn:xmpp:csi:0'/>".parse().unwrap(), &conn_id())
                .unwrap();
        let mut results = Results::new();
        f.csi
            .process(&inactive, Some(&f.session), &f.repo, &mut results, &Settings::default())
            .await
            .unwrap();
        assert!(state(&f.session).is_inactive());

        results.offer(presence_from("bob@example.com/a"));
        filter(&f, &mut results);
        assert!(results.is_empty());

        let active =
            Packet::from_connection("<active xmlns='urn:xmpp:csi:0'/>".parse().unwrap(), &conn_id())
                .unwrap();
        f.csi
            .process(&active, Some(&f.session), &f.repo, &mut results, &Settings::default())
            .await
            .unwrap();
        assert!(!state(&f.session).is_inactive());
        assert_eq!(results.len(), 1);
        assert!(results.front().unwrap().was_processed_by(ID));
    }

    #[test]
    fn test_max_queue_size_setting_overrides() {
        let csi = Csi::new(CsiStrategy::PresenceQueue, 50);
        assert_eq!(csi.max_queue_size(&Settings::default()), 50);
        assert_eq!(
            csi.max_queue_size(&Settings::default().with("max-queue-size", 5i64)),
            5
        );
    }
}
