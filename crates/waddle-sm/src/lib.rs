//! # waddle-sm
//!
//! XMPP session manager stanza pipeline for Waddle Social.
//!
//! The transport hands every stanza received on a client connection to the
//! [`SessionManager`], which runs it through pluggable processors and
//! returns the packets to send.
//!
//! ## Architecture
//!
//! - **Preprocess**: every [`Preprocessor`](processor::Preprocessor) in
//!   registration order. The authorization gate and addressing sanitizer
//!   live here. Any preprocessor may stop the packet.
//! - **Process**: the one [`Processor`](processor::Processor) claiming the
//!   packet's element path.
//! - **Filter**: every [`PacketFilter`](processor::PacketFilter) over the
//!   outbound results.
//! - **Stop**: [`StopListener`](processor::StopListener)s on connection
//!   teardown.
//!
//! Packets of one connection are serialized by the [`WorkerPool`]; sessions
//! of one account share common data through [`session::UserSession`].
//!
//! ## XEP Support
//!
//! - RFC 6120 resource binding, XEP-0386 (Bind2)
//! - XEP-0012 (Last Activity)
//! - XEP-0030 (Service Discovery, info)
//! - XEP-0077 (In-Band Registration)
//! - XEP-0078 (Non-SASL Authentication)
//! - XEP-0115 (Entity Capabilities)
//! - XEP-0352 (Client State Indication)

pub mod caps;
pub mod chain;
pub mod config;
pub mod matcher;
pub mod metrics;
pub mod packet;
pub mod processor;
pub mod processors;
pub mod rate_limit;
pub mod registry;
pub mod repository;
pub mod session;
pub mod session_manager;
pub mod settings;
pub mod telemetry;
pub mod workers;

mod error;

pub use caps::CapsCache;
pub use chain::{InlineChain, InlineStep, StepOutcome};
pub use config::SessionManagerConfig;
pub use error::{SmError, StanzaErrorCondition, StanzaErrorType};
pub use matcher::{ElementMatcher, MatcherList};
pub use packet::{ns, Command, Packet, Priority, Results, StanzaType};
pub use processor::{FeatureVisibility, ProcessorDescriptor};
pub use processors::{standard_registry, Collaborators};
pub use rate_limit::TokenBucketPool;
pub use registry::ProcessorRegistry;
pub use repository::{
    AuthRepository, MemoryRepository, NonAuthRepository, NonAuthUserRepository, UserRepository,
};
pub use session::{AuthState, DataKey, ResourceConnection, SessionRegistry};
pub use session_manager::SessionManager;
pub use settings::Settings;
pub use workers::WorkerPool;

use std::sync::Arc;

/// Build a session manager with every built-in processor.
///
/// `users` backs both the processors' account data and the restricted view
/// handed to every phase.
pub fn build(
    config: &SessionManagerConfig,
    users: Arc<dyn UserRepository>,
    auth: Arc<dyn AuthRepository>,
) -> Result<(SessionManager, Collaborators), SmError> {
    config.validate()?;
    let sessions = Arc::new(SessionRegistry::new(
        config.domain.clone(),
        config.resource_prefix(),
    ));
    let collaborators = Collaborators::new(sessions, Arc::clone(&users), auth, config);
    let registry = standard_registry(config, &collaborators)?;
    let repo: Arc<dyn NonAuthUserRepository> = Arc::new(NonAuthRepository::new(users));
    let manager = SessionManager::new(
        registry,
        Arc::clone(&collaborators.sessions),
        repo,
        config,
    );
    Ok((manager, collaborators))
}
