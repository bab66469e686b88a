//! In-band registration through the full pipeline.

mod common;

use common::{error_text, test_config, Harness};
use jid::BareJid;
use waddle_sm::{ns, AuthRepository, StanzaErrorCondition, StanzaType};

fn register(user: &str, password: &str) -> String {
    format!(
        "<iq xmlns='jabber:client' type='set' id='reg-{u}'><query xmlns='jabber:iq:register'>\
         <username>{u}</username><password>{p}</password></query></iq>",
        u = user,
        p = password
    )
}

#[tokio::test]
async fn test_register_then_login() {
    let h = Harness::new();
    h.connect(1);

    let form = h
        .send(
            1,
            "<iq xmlns='jabber:client' type='get' id='f1'><query xmlns='jabber:iq:register'/></iq>",
        )
        .await;
    let query = form
        .front()
        .unwrap()
        .element()
        .get_child("query", ns::IQ_REGISTER)
        .unwrap();
    assert!(query.get_child("username", ns::IQ_REGISTER).is_some());

    let results = h.send(1, &register("bob", "hunter2")).await;
    assert_eq!(results.front().unwrap().stanza_type(), Some(StanzaType::Result));

    let bob = BareJid::new("bob@example.com").unwrap();
    assert!(h.memory.plain_auth(&bob, "hunter2").await.unwrap());

    let results = h
        .send(
            1,
            "<iq xmlns='jabber:client' type='set' id='a1'><query xmlns='jabber:iq:auth'>\
             <username>bob</username><password>hunter2</password></query></iq>",
        )
        .await;
    assert_eq!(results.front().unwrap().stanza_type(), Some(StanzaType::Result));
    assert!(h.manager.sessions().get(&common::connection_id(1)).unwrap().is_resource_bound());
}

#[tokio::test]
async fn test_registrations_are_throttled_per_address() {
    let mut config = test_config();
    config.registration.rate = 1.0;
    config.registration.per_secs = 3600;
    let h = Harness::with_config(config);
    h.connect(1);
    h.connect(2);

    let first = h.send(1, &register("bob", "pw")).await;
    assert_eq!(first.front().unwrap().stanza_type(), Some(StanzaType::Result));

    let second = h.send(1, &register("carol", "pw")).await;
    assert_eq!(
        second.front().unwrap().error_condition(),
        Some(StanzaErrorCondition::ResourceConstraint)
    );
    assert_eq!(
        error_text(&second).as_deref(),
        Some("Server is busy. Too many registrations. Try later.")
    );

    let other_address = h.send(2, &register("carol", "pw")).await;
    assert_eq!(other_address.front().unwrap().stanza_type(), Some(StanzaType::Result));
}

#[tokio::test]
async fn test_disabled_registration_is_not_allowed() {
    let mut config = test_config();
    config.registration.enabled = false;
    let h = Harness::with_config(config);
    let session = h.connect(1);

    let features: Vec<String> = h
        .manager
        .stream_features(&session)
        .iter()
        .map(|f| f.ns())
        .collect();
    assert!(!features.contains(&ns::IQ_REGISTER_FEATURE.to_string()));

    let results = h.send(1, &register("bob", "pw")).await;
    assert_eq!(
        results.front().unwrap().error_condition(),
        Some(StanzaErrorCondition::NotAllowed)
    );
}

#[tokio::test]
async fn test_duplicate_account_conflicts() {
    let h = Harness::new();
    h.add_user("bob", "pw").await;
    h.connect(1);

    let results = h.send(1, &register("bob", "other")).await;
    assert_eq!(
        results.front().unwrap().error_condition(),
        Some(StanzaErrorCondition::Conflict)
    );
}
