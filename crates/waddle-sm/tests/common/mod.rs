//! Test harness: a fully wired session manager over an in-memory repository.

#![allow(dead_code)]

use std::sync::Arc;

use jid::{BareJid, Jid};
use minidom::Element;
use waddle_sm::{
    build, AuthRepository, Collaborators, MemoryRepository, Packet, ResourceConnection, Results,
    SessionManager, SessionManagerConfig,
};

pub const DOMAIN: &str = "example.com";

pub struct Harness {
    pub manager: Arc<SessionManager>,
    pub collaborators: Collaborators,
    pub memory: Arc<MemoryRepository>,
}

/// Configuration used by every harness unless a test overrides it.
pub fn test_config() -> SessionManagerConfig {
    SessionManagerConfig {
        domain: DOMAIN.to_string(),
        resource_prefix: Some("test".to_string()),
        workers: 2,
        ..SessionManagerConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SessionManagerConfig) -> Self {
        waddle_sm::telemetry::init_test();
        let memory = Arc::new(MemoryRepository::new());
        let (manager, collaborators) = build(&config, memory.clone(), memory.clone())
            .expect("harness configuration is valid");
        Self {
            manager: Arc::new(manager),
            collaborators,
            memory,
        }
    }

    /// Create an account with a password.
    pub async fn add_user(&self, user: &str, password: &str) -> BareJid {
        let jid = BareJid::new(&format!("{}@{}", user, DOMAIN)).unwrap();
        AuthRepository::add_user(self.memory.as_ref(), &jid, password)
            .await
            .unwrap();
        jid
    }

    /// Open an unauthenticated connection.
    pub fn connect(&self, n: u32) -> Arc<ResourceConnection> {
        self.manager
            .session_opened(connection_id(n), Some(format!("192.0.2.{}:5222", n)))
    }

    /// Open a connection, authorize it and bind `resource`.
    pub fn login(&self, n: u32, user: &str, resource: &str) -> Arc<ResourceConnection> {
        let session = self.connect(n);
        let sessions = self.manager.sessions();
        sessions
            .authorize(&session, BareJid::new(&format!("{}@{}", user, DOMAIN)).unwrap())
            .unwrap();
        sessions.bind_resource(&session, Some(resource)).unwrap();
        session
    }

    /// Dispatch XML as received on connection `n`.
    pub async fn send(&self, n: u32, xml: &str) -> Results {
        self.manager
            .dispatch_element(&connection_id(n), parse(xml))
            .await
            .unwrap()
    }
}

pub fn connection_id(n: u32) -> Jid {
    Jid::new(&format!("c2s@{}/conn-{}", DOMAIN, n)).unwrap()
}

pub fn parse(xml: &str) -> Element {
    xml.parse().unwrap()
}

/// `<text/>` of the first error in the results.
pub fn error_text(results: &Results) -> Option<String> {
    let error = results.errors().next()?;
    error
        .element()
        .children()
        .find(|c| c.name() == "error")?
        .children()
        .find(|c| c.name() == "text")
        .map(Element::text)
}

/// First packet with the given element name.
pub fn first_named<'a>(results: &'a Results, name: &str) -> Option<&'a Packet> {
    results.iter().find(|p| p.elem_name() == name)
}
