//! Integration tests for change propagation through virtual roots

mod common;

use observation::prelude::*;

use common::{Recorder, TestEnv};

/// Facet search at /content/search backed by /docs
fn add_virtual_root(env: &TestEnv) {
    let session = env.session();
    session.add_node("/", "docs", "hippostd:folder").unwrap();
    session.add_mixin("/docs", "mix:referenceable").unwrap();
    let docbase = session.node("/docs").unwrap().identifier.unwrap();
    session
        .add_node("/content", "search", "hippo:facetsearch")
        .unwrap();
    session
        .set_property("/content/search", "hippo:docbase", docbase)
        .unwrap();
    session
        .add_virtual_node("/content/search", "facet", "nt:unstructured")
        .unwrap();
    session.save().unwrap();
}

fn publish_document(env: &TestEnv) {
    let other = env.repo.login("editor");
    other.add_node("/docs", "news", "hippo:document").unwrap();
    other.save().unwrap();
}

#[test]
fn test_deep_subscription_hears_docbase_changes() {
    let env = common::setup_test_env();
    add_virtual_root(&env);
    let recorder = Recorder::new();
    let _sub = env.subscribe(&recorder, EventFilter::subtree("/content"));

    publish_document(&env);
    env.cycle();

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Generic);
    assert_eq!(events[0].path, "/content/search");
    assert_eq!(events[0].user_id, "VirtualRootBroadcaster");

    // a broadcast is delivered once
    recorder.take();
    env.cycle();
    assert!(recorder.take().is_empty());
}

#[test]
fn test_virtual_subscription_hears_its_virtual_root() {
    let env = common::setup_test_env();
    add_virtual_root(&env);
    let recorder = Recorder::new();
    let _sub = env.subscribe(&recorder, EventFilter::node("/content/search/facet"));

    publish_document(&env);
    env.cycle();
    assert_eq!(
        recorder.take(),
        vec![(EventKind::Generic, "/content/search".to_string())]
    );
}

#[test]
fn test_unrelated_subscription_is_not_notified() {
    let env = common::setup_test_env();
    add_virtual_root(&env);
    let session = env.session();
    session.add_node("/", "other", "nt:unstructured").unwrap();
    session.save().unwrap();

    let recorder = Recorder::new();
    let _sub = env.subscribe(&recorder, EventFilter::subtree("/other"));

    publish_document(&env);
    env.cycle();
    assert!(recorder.take().is_empty());
}

#[test]
fn test_node_type_filter_without_documents_skips_broadcasts() {
    let env = common::setup_test_env();
    add_virtual_root(&env);
    let recorder = Recorder::new();
    let _sub = env.subscribe(
        &recorder,
        EventFilter::subtree("/content").with_node_types(["hippo:facetsearch"]),
    );

    publish_document(&env);
    env.cycle();
    assert!(recorder.take().is_empty());
}

#[test]
fn test_disabled_virtual_roots() {
    let env = common::setup_with_config(ObservationConfig {
        virtual_roots_disabled: true,
        ..ObservationConfig::default()
    });
    add_virtual_root(&env);
    let recorder = Recorder::new();
    let _sub = env.subscribe(&recorder, EventFilter::subtree("/content"));
    // only the listener's own native registration
    assert_eq!(env.repo.native_listener_count(), 1);

    publish_document(&env);
    env.cycle();
    assert!(recorder.take().is_empty());
}

#[test]
fn test_last_unsubscribe_stops_broadcaster() {
    let env = common::setup_test_env();
    add_virtual_root(&env);
    let recorder = Recorder::new();
    let sub = env.subscribe(&recorder, EventFilter::subtree("/content"));
    // listener queue plus the docbase listener
    assert_eq!(env.repo.native_listener_count(), 2);

    sub.dispose();
    assert!(env.coordinator.registered_event_listeners().is_empty());
    assert_eq!(env.repo.native_listener_count(), 0);
}
