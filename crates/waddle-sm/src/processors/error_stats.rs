//! Counts error stanzas leaving the pipeline, per condition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::metrics;
use crate::packet::{Packet, Results};
use crate::processor::{PacketFilter, ProcessorDescriptor};
use crate::repository::NonAuthUserRepository;
use crate::session::ResourceConnection;
use crate::settings::Settings;

pub const ID: &str = "error-stats";

const UNKNOWN: &str = "unknown";

#[derive(Debug, Default)]
pub struct ErrorStats {
    total: AtomicU64,
    by_condition: DashMap<String, u64>,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Snapshot of the per-condition counters.
    pub fn by_condition(&self) -> BTreeMap<String, u64> {
        self.by_condition
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

impl PacketFilter for ErrorStats {
    fn filter(
        &self,
        _packet: Option<&Packet>,
        _session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        _settings: &Settings,
    ) {
        for packet in results.iter_mut() {
            if !packet.is_error() || packet.was_processed_by(ID) {
                continue;
            }
            let name = packet.error_condition().map_or(UNKNOWN, |c| c.as_str());
            self.total.fetch_add(1, Ordering::Relaxed);
            *self.by_condition.entry(name.to_string()).or_insert(0) += 1;
            metrics::record_error_stanza(name);
            packet.processed(ID);
        }
    }
}

pub fn descriptor() -> ProcessorDescriptor {
    descriptor_with(Arc::new(ErrorStats::new()))
}

/// Register a caller-owned counter set, so it can be read later.
pub fn descriptor_with(stats: Arc<ErrorStats>) -> ProcessorDescriptor {
    ProcessorDescriptor::new(ID).filter(stats)
}
