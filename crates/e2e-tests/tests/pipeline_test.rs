//! End-to-end updater pipeline tests.
//!
//! Changes go through the change queue, enforcement, bulk write and result
//! interpretation into the in-memory index.

use std::collections::BTreeSet;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;

use e2e_tests::{long_ago, open_policy, TestHarness};
use searchsync_indexing::BulkWriteFailure;
use searchsync_types::{AckStatus, ChangeMetadata, PolicyEnforcer, ThingEvent, ThingEventKind, ThingId};

fn readers(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_change_is_indexed_and_acknowledged() {
    let harness = TestHarness::start();
    harness.policies.put(open_policy("ns:p1", 1, "alice"));
    harness
        .things
        .put("ns:t1", 1, "ns:p1", json!({ "color": "red" }), long_ago());

    let ack = harness.apply(ChangeMetadata::new("ns:t1", 1)).await;
    assert!(ack.is_success());
    assert_eq!(ack.thing_id, ThingId::new("ns:t1"));

    let doc = harness.index.get(&ThingId::new("ns:t1")).unwrap();
    assert_eq!(doc.thing_revision, 1);
    assert_eq!(doc.policy_revision, Some(1));
    let entry = doc.entry("/attributes/color").unwrap();
    assert_eq!(entry.value, json!("red"));
    assert_eq!(entry.readers, readers(&["alice"]));
    assert_eq!(doc.global_readers, readers(&["alice"]));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_revoked_paths_are_not_indexed() {
    let harness = TestHarness::start();
    harness.policies.put(
        PolicyEnforcer::new("ns:p1", 1)
            .grant("alice", "/")
            .grant("bob", "/attributes/public")
            .revoke("alice", "/attributes/secret"),
    );
    harness.things.put(
        "ns:t1",
        1,
        "ns:p1",
        json!({ "public": 1, "secret": 2 }),
        long_ago(),
    );

    assert!(harness.apply(ChangeMetadata::new("ns:t1", 1)).await.is_success());

    let doc = harness.index.get(&ThingId::new("ns:t1")).unwrap();
    assert_eq!(
        doc.entry("/attributes/public").unwrap().readers,
        readers(&["alice", "bob"])
    );
    assert!(doc.entry("/attributes/secret").is_none());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_deleted_thing_removes_document() {
    let harness = TestHarness::start();
    harness.policies.put(open_policy("ns:p1", 1, "alice"));
    harness
        .things
        .put("ns:t1", 1, "ns:p1", json!({ "a": 1 }), long_ago());
    assert!(harness.apply(ChangeMetadata::new("ns:t1", 1)).await.is_success());
    assert_eq!(harness.index.len(), 1);

    harness.things.remove("ns:t1");
    let deletion = ChangeMetadata::new("ns:t1", 2)
        .with_events(vec![ThingEvent::new(2, ThingEventKind::Deleted, "")]);
    assert!(harness.apply(deletion).await.is_success());
    assert!(harness.index.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_missing_policy_fails_closed() {
    let harness = TestHarness::start();
    harness
        .things
        .put("ns:t1", 1, "ns:gone", json!({ "a": 1 }), long_ago());

    let ack = harness.apply(ChangeMetadata::new("ns:t1", 1)).await;
    assert!(ack.is_success());
    assert!(harness.index.get(&ThingId::new("ns:t1")).is_none());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_older_revision_never_overwrites_newer_document() {
    let harness = TestHarness::start();
    harness.policies.put(open_policy("ns:p1", 1, "alice"));
    harness
        .things
        .put("ns:t1", 5, "ns:p1", json!({ "a": 5 }), long_ago());
    assert!(harness.apply(ChangeMetadata::new("ns:t1", 5)).await.is_success());

    // A late notification for revision 3 still acknowledges.
    assert!(harness.apply(ChangeMetadata::new("ns:t1", 3)).await.is_success());

    let doc = harness.index.get(&ThingId::new("ns:t1")).unwrap();
    assert_eq!(doc.thing_revision, 5);
    assert_eq!(doc.entry("/attributes/a").unwrap().value, json!(5));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_policy_change_reindexes_visibility() {
    let harness = TestHarness::start();
    harness.policies.put(open_policy("ns:p1", 1, "alice"));
    harness
        .things
        .put("ns:t1", 1, "ns:p1", json!({ "a": 1 }), long_ago());
    assert!(harness.apply(ChangeMetadata::new("ns:t1", 1)).await.is_success());

    harness
        .policies
        .put(open_policy("ns:p1", 2, "alice").grant("bob", "/"));
    let change = ChangeMetadata::new("ns:t1", 1)
        .with_policy("ns:p1", 2)
        .invalidating_policy();
    assert!(harness.apply(change).await.is_success());

    let doc = harness.index.get(&ThingId::new("ns:t1")).unwrap();
    assert_eq!(doc.policy_revision, Some(2));
    assert_eq!(doc.global_readers, readers(&["alice", "bob"]));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_changes_are_all_acknowledged() {
    let harness = TestHarness::start();
    harness.policies.put(open_policy("ns:p1", 1, "alice"));
    for i in 0..50 {
        harness
            .things
            .put(&format!("ns:t{i}"), 1, "ns:p1", json!({ "n": i }), long_ago());
    }

    let acks = join_all((0..50).map(|i| harness.apply(ChangeMetadata::new(format!("ns:t{i}"), 1)))).await;

    assert!(acks.iter().all(|ack| ack.is_success()));
    assert_eq!(harness.index.len(), 50);

    // Statistics are recorded once a batch is fully interpreted.
    let deadline = tokio::time::Instant::now() + e2e_tests::WAIT;
    while harness.pipeline.stats().acked < 50 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let stats = harness.pipeline.stats();
    assert!(stats.batches >= 1);
    assert_eq!(stats.acked, 50);
    assert_eq!(stats.nacked, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unacknowledged_write_is_nacked() {
    let harness = TestHarness::start();
    harness.policies.put(open_policy("ns:p1", 1, "alice"));
    harness
        .things
        .put("ns:t1", 1, "ns:p1", json!({ "a": 1 }), long_ago());
    harness
        .index
        .inject_failure(BulkWriteFailure::Other("connection reset".to_string()));

    let ack = harness.apply(ChangeMetadata::new("ns:t1", 1)).await;
    assert!(matches!(ack.status, AckStatus::Failure(_)));

    // The next attempt goes through.
    assert!(harness.apply(ChangeMetadata::new("ns:t1", 1)).await.is_success());
    assert_eq!(harness.index.len(), 1);

    harness.shutdown().await;
}
