//! Dispatch engine.
//!
//! Runs the four processor phases for every inbound packet:
//!
//! 1. **Preprocess**: every preprocessor in registration order; the first to
//!    return `true` stops the packet.
//! 2. **Process**: the single processor claiming the packet's longest
//!    element path. Unclaimed packets are dropped.
//! 3. **Filter**: every filter over the accumulated results.
//! 4. **Stop**: on teardown, every stop listener, then the filters over the
//!    teardown results, then logout.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use jid::Jid;
use minidom::Element;
use tracing::{debug, instrument, trace, warn};

use crate::config::SessionManagerConfig;
use crate::error::SmError;
use crate::metrics;
use crate::packet::{Packet, Results};
use crate::processor::{Processor, StopListener};
use crate::registry::ProcessorRegistry;
use crate::repository::NonAuthUserRepository;
use crate::session::{ResourceConnection, SessionRegistry};
use crate::settings::Settings;

/// Session manager: processor registry, sessions and the dispatch loop.
pub struct SessionManager {
    registry: ProcessorRegistry,
    sessions: Arc<SessionRegistry>,
    repo: Arc<dyn NonAuthUserRepository>,
    global: Settings,
    settings: HashMap<String, Settings>,
}

impl SessionManager {
    /// Build the engine, resolving per-processor settings once.
    pub fn new(
        registry: ProcessorRegistry,
        sessions: Arc<SessionRegistry>,
        repo: Arc<dyn NonAuthUserRepository>,
        config: &SessionManagerConfig,
    ) -> Self {
        let global = Settings::new(config.settings.clone());
        let settings = registry
            .ids()
            .map(|id| {
                (
                    id.to_string(),
                    Settings::merged(&global, config.processors.get(id)),
                )
            })
            .collect();
        debug!(processors = registry.len(), "Session manager ready");
        Self {
            registry,
            sessions,
            repo,
            global,
            settings,
        }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Settings passed to a processor.
    pub fn settings_for(&self, processor_id: &str) -> &Settings {
        self.settings.get(processor_id).unwrap_or(&self.global)
    }

    /// Admit a new client connection.
    pub fn session_opened(
        &self,
        connection_id: Jid,
        remote_address: Option<String>,
    ) -> Arc<ResourceConnection> {
        self.sessions.open(connection_id, remote_address)
    }

    /// Stream features for the session's current state.
    pub fn stream_features(&self, session: &ResourceConnection) -> Vec<Element> {
        self.registry.stream_features(session.auth_state())
    }

    /// Wrap an element received on a connection and dispatch it.
    pub async fn dispatch_element(
        &self,
        connection_id: &Jid,
        element: Element,
    ) -> Result<Results, SmError> {
        let packet = Packet::from_connection(element, connection_id)?;
        let session = self.sessions.get(connection_id);
        self.dispatch(packet, session.as_ref()).await
    }

    /// Run a packet through the pipeline and return the outbound results.
    ///
    /// Preprocessor failures are logged and ignored. A failing main
    /// processor aborts the dispatch with its error.
    #[instrument(
        skip(self, packet, session),
        fields(
            element = %packet.elem_name(),
            id = packet.id().unwrap_or("-"),
            connection = %session.map(|s| s.connection_id().to_string()).unwrap_or_default()
        )
    )]
    pub async fn dispatch(
        &self,
        mut packet: Packet,
        session: Option<&Arc<ResourceConnection>>,
    ) -> Result<Results, SmError> {
        let started = Instant::now();
        let element = packet.elem_name().to_string();
        let repo: &dyn NonAuthUserRepository = self.repo.as_ref();
        let mut results = Results::new();

        if let Some(session) = session {
            session.touch();
        }

        let stopped = self.preprocess(&mut packet, session, repo, &mut results);

        let outcome = if stopped {
            "blocked"
        } else {
            match self.main_processor(&packet) {
                Some((id, processor)) => {
                    trace!(processor = %id, "Processing packet");
                    let settings = self.settings_for(&id);
                    if let Err(e) = processor
                        .process(&packet, session, repo, &mut results, settings)
                        .await
                    {
                        metrics::record_stanza(&element, "error");
                        return Err(e);
                    }
                    packet.processed(&id);
                    "processed"
                }
                None => {
                    debug!(packet = %packet, "No processor for packet, dropping");
                    metrics::record_unhandled(&element);
                    "unhandled"
                }
            }
        };

        self.run_filters(Some(&packet), session, repo, &mut results);

        metrics::record_dispatch_latency(started.elapsed().as_secs_f64() * 1000.0, &element);
        metrics::record_stanza(&element, outcome);
        Ok(results)
    }

    fn preprocess(
        &self,
        packet: &mut Packet,
        session: Option<&Arc<ResourceConnection>>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
    ) -> bool {
        for (id, preprocessor) in self.registry.preprocessors() {
            match preprocessor.preprocess(packet, session, repo, results, self.settings_for(id)) {
                Ok(true) => {
                    debug!(processor = %id, packet = %packet, "Packet stopped by preprocessor");
                    metrics::record_preprocess_block(id);
                    return true;
                }
                Ok(false) => {}
                Err(e) if e.is_packet_error_type() => {
                    trace!(processor = %id, "Ignoring error response to error packet");
                }
                Err(e) => {
                    warn!(processor = %id, error = %e, "Preprocessor failed, continuing");
                }
            }
        }
        false
    }

    fn main_processor(&self, packet: &Packet) -> Option<(String, Arc<dyn Processor>)> {
        let descriptor = self.registry.lookup(packet)?;
        let processor = descriptor.get_processor()?;
        Some((descriptor.id().to_string(), Arc::clone(processor)))
    }

    fn run_filters(
        &self,
        packet: Option<&Packet>,
        session: Option<&Arc<ResourceConnection>>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
    ) {
        for (id, filter) in self.registry.filters() {
            filter.filter(packet, session, repo, results, self.settings_for(id));
        }
    }

    /// Tear a connection down.
    ///
    /// Stop listeners run while the session is still authorized; the
    /// connection is then logged out and removed.
    #[instrument(skip(self))]
    pub async fn close_session(&self, connection_id: &Jid) -> Results {
        let mut results = Results::new();
        let Some(session) = self.sessions.get(connection_id) else {
            debug!("Close requested for unknown connection");
            return results;
        };
        let repo: &dyn NonAuthUserRepository = self.repo.as_ref();

        let listeners: Vec<(String, Arc<dyn StopListener>)> = self
            .registry
            .stop_listeners()
            .map(|(id, listener)| (id.to_string(), Arc::clone(listener)))
            .collect();
        for (id, listener) in listeners {
            if let Err(e) = listener
                .stopped(&session, repo, &mut results, self.settings_for(&id))
                .await
            {
                warn!(processor = %id, error = %e, "Stop listener failed");
            }
        }

        self.run_filters(None, Some(&session), repo, &mut results);
        self.sessions.close(connection_id);
        results
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.registry)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}
