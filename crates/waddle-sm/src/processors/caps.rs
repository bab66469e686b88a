//! Records the entity capabilities announced in a client's presence and asks
//! the client about nodes the [`CapsCache`] has not seen yet.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jid::{BareJid, Jid};
use tracing::{debug, trace};

use crate::caps::{caps_element, caps_nodes, caps_query, CapsCache};
use crate::error::SmError;
use crate::packet::{Packet, Results, StanzaType};
use crate::processor::{Preprocessor, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::{DataKey, ResourceConnection};
use crate::settings::Settings;

pub const ID: &str = "caps";

const NODES_KEY: DataKey<Vec<String>> = DataKey::new("caps-nodes");

const QUERY_BACKOFF: Duration = Duration::from_secs(60);

/// Upper bound on nodes awaiting a disco#info answer.
const MAX_PENDING: usize = 1024;

/// Caps nodes from the connection's latest available presence.
pub fn session_caps(session: &ResourceConnection) -> Vec<String> {
    session
        .data()
        .get(&NODES_KEY)
        .map(|nodes| nodes.as_ref().clone())
        .unwrap_or_default()
}

pub struct CapsPresence {
    cache: Arc<CapsCache>,
    // node -> when it was last queried
    pending: DashMap<String, Instant>,
}

impl CapsPresence {
    pub fn new(cache: Arc<CapsCache>) -> Self {
        Self {
            cache,
            pending: DashMap::new(),
        }
    }

    /// Claim a node for querying unless a recent query is still outstanding.
    fn claim(&self, node: &str, now: Instant) -> bool {
        // Checked before taking the entry lock; `len` reads every shard.
        let full = self.pending.len() >= MAX_PENDING;
        match self.pending.entry(node.to_string()) {
            Entry::Occupied(mut at) => {
                if now.duration_since(*at.get()) < QUERY_BACKOFF {
                    return false;
                }
                at.insert(now);
                true
            }
            Entry::Vacant(_) if full => {
                debug!(node, "Too many unanswered caps queries, skipping");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    /// Forget nodes that got cached or whose query went unanswered.
    fn sweep(&self, now: Instant) {
        self.pending.retain(|node, queried| {
            now.duration_since(*queried) < QUERY_BACKOFF && !self.cache.contains(node)
        });
    }
}

impl Preprocessor for CapsPresence {
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
        if packet.elem_name() != "presence"
            || packet.stanza_type() != Some(StanzaType::Available)
            || packet.packet_from() != Some(session.connection_id())
        {
            return Ok(false);
        }
        let Ok(jid) = session.jid() else {
            return Ok(false);
        };
        let Some(c) = caps_element(packet.element()) else {
            return Ok(false);
        };

        let nodes = caps_nodes(c);
        trace!(jid = %jid, nodes = ?nodes, "Presence caps");
        let server = Jid::from(BareJid::new(session.domain())?);
        let to = Jid::from(jid);
        let now = Instant::now();
        self.sweep(now);
        for node in self.cache.unknown(&nodes) {
            if !self.claim(node, now) {
                continue;
            }
            debug!(node, "Querying unknown caps node");
            results.offer(caps_query(&server, &to, node)?.with_packet_to(session.connection_id().clone()));
        }

        session.data().put(&NODES_KEY, nodes);
        Ok(false)
    }
}

pub fn descriptor(cache: Arc<CapsCache>) -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID).preprocessor(Arc::new(CapsPresence::new(cache)))
}
