//! XEP-0012: Last Activity.
//!
//! Outgoing message and presence stanzas stamp the sending connection. A
//! query is answered from the freshest stamp of the target's live
//! connections, falling back to the time persisted when the target's last
//! session stopped. A query to the server returns its uptime.
//!
//! ## References
//!
//! - <https://xmpp.org/extensions/xep-0012.html>

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jid::{BareJid, Jid};
use minidom::Element;
use tracing::{debug, trace, warn};

use crate::error::{SmError, StanzaErrorCondition};
use crate::packet::{ns, Packet, Results, StanzaType};
use crate::processor::{Preprocessor, Processor, ProcessorDescriptor, StopListener};
use crate::repository::{NonAuthUserRepository, UserRepository};
use crate::session::{DataKey, ResourceConnection, SessionRegistry};
use crate::settings::Settings;

use super::error_reply;

pub const ID: &str = ns::LAST;

const STAMP_KEY: DataKey<AtomicI64> = DataKey::new("last-activity");

/// Public-data subnode and key of the persisted stamp.
pub const SUBNODE: &str = ns::LAST;
pub const KEY: &str = "LAST_ACTIVITY_KEY";

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Last stamped activity of a connection, in milliseconds since the epoch.
pub fn last_activity(session: &ResourceConnection) -> Option<i64> {
    session
        .data()
        .get(&STAMP_KEY)
        .map(|stamp| stamp.load(Ordering::Acquire))
}

fn stamp(session: &ResourceConnection, millis: i64) {
    session
        .data()
        .get_or_insert_with(&STAMP_KEY, || AtomicI64::new(0))
        .fetch_max(millis, Ordering::AcqRel);
}

pub struct LastActivity {
    sessions: Arc<SessionRegistry>,
    users: Arc<dyn UserRepository>,
    started: DateTime<Utc>,
}

impl LastActivity {
    pub fn new(sessions: Arc<SessionRegistry>, users: Arc<dyn UserRepository>) -> Self {
        Self {
            sessions,
            users,
            started: Utc::now(),
        }
    }

    fn freshest(connections: &[Arc<ResourceConnection>]) -> Option<i64> {
        connections.iter().filter_map(|c| last_activity(c)).max()
    }

    /// Stamp for an account with live connections, narrowed to one resource
    /// when the target is a full JID.
    fn online_stamp(&self, target: &Jid) -> Option<i64> {
        let connections = self.sessions.connections_for(&target.to_bare());
        match target.resource() {
            Some(resource) => connections
                .iter()
                .filter(|c| c.resource().as_deref() == Some(resource.as_str()))
                .find_map(|c| last_activity(c)),
            None => Self::freshest(&connections),
        }
    }

    async fn stored_stamp(
        &self,
        user: &BareJid,
        repo: &dyn NonAuthUserRepository,
    ) -> Result<Option<i64>, SmError> {
        let value = repo.get_public_data(user, SUBNODE, KEY).await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    fn reply(packet: &Packet, seconds: i64) -> Packet {
        packet.ok_result(Some(
            Element::builder("query", ns::LAST)
                .attr("seconds", seconds.max(0).to_string())
                .build(),
        ))
    }

    async fn answer(
        &self,
        packet: &Packet,
        session: &Arc<ResourceConnection>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
    ) -> Result<(), SmError> {
        let now = now_millis();
        let target = match packet.stanza_to() {
            None => {
                let own = session
                    .user_session()
                    .map(|u| Self::freshest(&u.connections()))
                    .unwrap_or_else(|| last_activity(session));
                results.offer(Self::reply(packet, (now - own.unwrap_or(now)) / 1000));
                return Ok(());
            }
            Some(to) => to,
        };

        if target.node().is_none() && target.domain().as_str() == session.domain() {
            let uptime = (Utc::now() - self.started).num_seconds();
            trace!(uptime, "Answering server uptime");
            results.offer(Self::reply(packet, uptime));
            return Ok(());
        }

        if let Some(stamp) = self.online_stamp(target) {
            results.offer(Self::reply(packet, (now - stamp) / 1000));
            return Ok(());
        }

        let reply = match self.stored_stamp(&target.to_bare(), repo).await {
            Ok(Some(stamp)) => Some(Self::reply(packet, (now - stamp) / 1000)),
            Ok(None) => error_reply(
                packet,
                StanzaErrorCondition::ItemNotFound,
                "Unknown last activity time",
                false,
            ),
            Err(SmError::UserNotFound(_)) => error_reply(
                packet,
                StanzaErrorCondition::ItemNotFound,
                "User not found",
                false,
            ),
            Err(e) => return Err(e),
        };
        results.extend(reply);
        Ok(())
    }
}

impl Preprocessor for LastActivity {
    fn preprocess(
        &self,
        packet: &mut Packet,
        session: Option<&Arc<ResourceConnection>>,
        _repo: &dyn NonAuthUserRepository,
        _results: &mut Results,
        _settings: &Settings,
    ) -> Result<bool, SmError> {
        let Some(session) = session else {
            return Ok(false);
        };
        if !matches!(packet.elem_name(), "message" | "presence") {
            return Ok(false);
        }
        let Ok(user) = session.bare_jid() else {
            return Ok(false);
        };
        if packet.stanza_from().map(Jid::to_bare) == Some(user) {
            stamp(session, now_millis());
        }
        Ok(false)
    }
}

#[async_trait]
impl Processor for LastActivity {
    async fn process(
        &self,
        packet: &Packet,
        session: Option<&Arc<ResourceConnection>>,
        repo: &dyn NonAuthUserRepository,
        results: &mut Results,
        _settings: &Settings,
    ) -> Result<(), SmError> {
        let Some(session) = session else {
            return Ok(());
        };
        match packet.stanza_type() {
            Some(StanzaType::Get) => self.answer(packet, session, repo, results).await,
            Some(StanzaType::Set) => {
                results.extend(error_reply(
                    packet,
                    StanzaErrorCondition::BadRequest,
                    "Message type is incorrect",
                    false,
                ));
                Ok(())
            }
            _ => {
                debug!(packet = %packet, "Ignoring last activity response");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StopListener for LastActivity {
    async fn stopped(
        &self,
        session: &Arc<ResourceConnection>,
        _repo: &dyn NonAuthUserRepository,
        _results: &mut Results,
        _settings: &Settings,
    ) -> Result<(), SmError> {
        let Ok(user) = session.bare_jid() else {
            return Ok(());
        };
        let millis = last_activity(session).unwrap_or_else(now_millis);
        let subnode = format!("public/{}", SUBNODE);
        if let Err(e) = self
            .users
            .set_data(&user, &subnode, KEY, &millis.to_string())
            .await
        {
            warn!(user = %user, error = %e, "Persisting last activity failed");
            return Err(e);
        }
        debug!(user = %user, millis, "Last activity persisted");
        Ok(())
    }
}

pub fn descriptor(sessions: Arc<SessionRegistry>, users: Arc<dyn UserRepository>) -> ProcessorDescriptor {
    let last = Arc::new(LastActivity::new(sessions, users));
    ProcessorDescriptor::new(ID)
        .handles(&["iq", "query"], ns::LAST)
        .preprocessor(last.clone())
        .processor(last.clone())
        .stop_listener(last)
        .disco_feature(ns::LAST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryRepository, NonAuthRepository};

    struct Fixture {
        memory: Arc<MemoryRepository>,
        sessions: Arc<SessionRegistry>,
        last: LastActivity,
        repo: NonAuthRepository,
    }

    fn fixture() -> Fixture {
        let memory = Arc::new(MemoryRepository::new());
        let sessions = Arc::new(SessionRegistry::new("example.com", "t"));
        Fixture {
            last: LastActivity::new(Arc::clone(&sessions), memory.clone()),
            repo: NonAuthRepository::new(memory.clone()),
            memory,
            sessions,
        }
    }

    fn bound(f: &Fixture, conn: &str, user: &str, resource: &str) -> Arc<ResourceConnection> {
        let session = f.sessions.open(Jid::new(conn).unwrap(), None);
        f.sessions
            .authorize(&session, BareJid::new(user).unwrap())
            .unwrap();
        f.sessions.bind_resource(&session, Some(resource)).unwrap();
        session
    }

    fn query(to: Option<&str>) -> Packet {
        let to = to.map(|t| format!(" to='{}'", t)).unwrap_or_default();
        Packet::new(
            format!(
                "<iq xmlns='jabber:client' type='get' id='l1'{}><query xmlns='jabber:iq:last'/></iq>",
                to
            )
            .parse()
            .unwrap(),
        )
        .unwrap()
    }

    async fn ask(f: &Fixture, session: &Arc<ResourceConnection>, packet: &Packet) -> Results {
        let mut results = Results::new();
        f.last
            .process(packet, Some(session), &f.repo, &mut results, &Settings::default())
            .await
            .unwrap();
        results
    }

    fn seconds(results: &Results) -> Option<i64> {
        results
            .front()?
            .element()
            .get_child("query", ns::LAST)?
            .attr("seconds")?
            .parse()
            .ok()
    }

    #[test]
    fn test_own_stanzas_stamp() {
        let f = fixture();
        let session = bound(&f, "c2s@example.com/c1", "alice@example.com", "phone");
        let mut message = Packet::new(
            "<message xmlns='jabber:client' from='alice@example.com/phone' to='bob@example.com'/>"
                .parse()
                .unwrap(),
        )
        .unwrap();
        assert!(last_activity(&session).is_none());
        let stop = f
            .last
            .preprocess(&mut message, Some(&session), &f.repo, &mut Results::new(), &Settings::default())
            .unwrap();
        assert!(!stop);
        assert!(last_activity(&session).is_some());
    }

    #[tokio::test]
    async fn test_online_user_answered_from_sessions() {
        let f = fixture();
        let asker = bound(&f, "c2s@example.com/c1", "alice@example.com", "phone");
        let bob = bound(&f, "c2s@example.com/c2", "bob@example.com", "desk");
        stamp(&bob, now_millis() - 120_000);

        let results = ask(&f, &asker, &query(Some("bob@example.com"))).await;
        let secs = seconds(&results).unwrap();
        assert!((119..=121).contains(&secs), "seconds = {}", secs);
    }

    #[tokio::test]
    async fn test_offline_user_uses_stored_stamp() {
        let f = fixture();
        let asker = bound(&f, "c2s@example.com/c1", "alice@example.com", "phone");
        let carol = BareJid::new("carol@example.com").unwrap();
        UserRepository::add_user(f.memory.as_ref(), &carol).await.unwrap();

        let results = ask(&f, &asker, &query(Some("carol@example.com"))).await;
        assert_eq!(
            results.errors().next().and_then(Packet::error_condition),
            Some(StanzaErrorCondition::ItemNotFound)
        );

        let carol_session = bound(&f, "c2s@example.com/c3", "carol@example.com", "web");
        stamp(&carol_session, now_millis() - 60_000);
        f.last
            .stopped(&carol_session, &f.repo, &mut Results::new(), &Settings::default())
            .await
            .unwrap();
        f.sessions.close(carol_session.connection_id());

        let results = ask(&f, &asker, &query(Some("carol@example.com"))).await;
        let secs = seconds(&results).unwrap();
        assert!((59..=61).contains(&secs), "seconds = {}", secs);
    }

    #[tokio::test]
    async fn test_unknown_user_not_found() {
        let f = fixture();
        let asker = bound(&f, "c2s@example.com/c1", "alice@example.com", "phone");
        let results = ask(&f, &asker, &query(Some("nobody@example.com"))).await;
        let error = results.front().unwrap();
        assert_eq!(error.error_condition(), Some(StanzaErrorCondition::ItemNotFound));
    }

    #[tokio::test]
    async fn test_server_uptime_and_set() {
        let f = fixture();
        let asker = bound(&f, "c2s@example.com/c1", "alice@example.com", "phone");
        let results = ask(&f, &asker, &query(Some("example.com"))).await;
        assert!(seconds(&results).unwrap() < 5);

        let mut set = query(None);
        set.element_mut().set_attr("type", "set");
        let results = ask(&f, &asker, &set).await;
        assert_eq!(results.errors().count(), 1);
    }
}
