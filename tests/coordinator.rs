//! Coordinators replicating one document over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use cowrite::Error;
use cowrite::broker::Broker;
use cowrite::broker::MemoryBroker;
use cowrite::config::Config;
use cowrite::coordinator::ClientUpdate;
use cowrite::coordinator::Coordinator;
use cowrite::coordinator::CoordinatorHandle;
use cowrite::crdt::id::Identifier;
use cowrite::crdt::op::OpKind;
use cowrite::crdt::op::Operation;
use cowrite::document::Delivery;
use cowrite::document::Document;
use cowrite::key::ReplicaKey;
use cowrite::snapshot::SnapshotId;
use tokio::sync::mpsc;

const TOPIC: &str = "doc";

fn config() -> Config {
    let mut config = Config::default();
    config.sync.sweep_interval_ms = 20;
    config.sync.dependency_timeout_ms = 200;
    config.broker.retry_initial_ms = 5;
    config.broker.retry_max_ms = 50;
    return config;
}

async fn spawn(broker: &MemoryBroker, n: u8) -> CoordinatorHandle {
    return spawn_with(broker, n, &config()).await;
}

async fn spawn_with(broker: &MemoryBroker, n: u8, config: &Config) -> CoordinatorHandle {
    let broker: Arc<dyn Broker> = Arc::new(broker.clone());
    return Coordinator::spawn(TOPIC, ReplicaKey::from_secret([n; 32]), broker, config).await;
}

async fn wait_for_text(handle: &CoordinatorHandle, expected: &str) {
    for _ in 0..300 {
        if handle.current_text().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "replica never reached {expected:?}, has {:?}",
        handle.current_text().await.unwrap()
    );
}

async fn wait_for_same(handles: &[&CoordinatorHandle]) -> String {
    for _ in 0..300 {
        let mut texts = Vec::new();
        for handle in handles {
            texts.push(handle.current_text().await.unwrap());
        }
        if texts.iter().all(|t| *t == texts[0]) {
            return texts.swap_remove(0);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("replicas never converged");
}

async fn next(updates: &mut mpsc::Receiver<ClientUpdate>) -> ClientUpdate {
    return tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("no update in time")
        .expect("update channel closed");
}

/// Skip updates until one satisfies `pred`.
async fn next_matching(
    updates: &mut mpsc::Receiver<ClientUpdate>,
    pred: impl Fn(&ClientUpdate) -> bool,
) -> ClientUpdate {
    loop {
        let update = next(updates).await;
        if pred(&update) {
            return update;
        }
    }
}

#[tokio::test]
async fn edits_reach_remote_clients() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;

    let mut alice = a.connect("alice").await.unwrap();
    let mut bob = b.connect("bob").await.unwrap();
    assert_eq!(next(&mut alice).await, ClientUpdate::FullState(String::new()));
    assert_eq!(next(&mut bob).await, ClientUpdate::FullState(String::new()));

    a.edit("alice", "hello", Some(5)).await.unwrap();
    assert_eq!(a.current_text().await.unwrap(), "hello");
    // Remote characters arrive one operation at a time.
    next_matching(&mut bob, |u| *u == ClientUpdate::Text("hello".into())).await;

    b.edit("bob", "hello world", Some(11)).await.unwrap();
    next_matching(&mut alice, |u| *u == ClientUpdate::Text("hello world".into())).await;
    assert!(alice.try_recv().is_err());
}

#[tokio::test]
async fn concurrent_edits_converge() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let c = spawn(&broker, 3).await;
    let _alice = a.connect("alice").await.unwrap();
    let _bob = b.connect("bob").await.unwrap();
    let _carol = c.connect("carol").await.unwrap();

    a.edit("alice", "shared text", None).await.unwrap();
    wait_for_text(&b, "shared text").await;
    wait_for_text(&c, "shared text").await;

    let (ra, rb, rc) = tokio::join!(
        a.edit("alice", "A shared text", Some(2)),
        b.edit("bob", "shared text B", Some(13)),
        c.edit("carol", "shared CC text", Some(9)),
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let text = wait_for_same(&[&a, &b, &c]).await;
    assert!(text.starts_with("A "));
    assert!(text.ends_with(" B"));
    assert!(text.contains("CC"));
}

#[tokio::test]
async fn stale_client_edit_lands_by_id() {
    let broker = MemoryBroker::new();
    // Alice's channel fills up with the initial state, so she never sees
    // Bob's edit and keeps editing her own stale copy.
    let mut tight = config();
    tight.sync.client_capacity = 1;
    let a = spawn_with(&broker, 1, &tight).await;
    let b = spawn(&broker, 2).await;
    let _alice = a.connect("alice").await.unwrap();
    let mut bob = b.connect("bob").await.unwrap();

    a.edit("alice", "abc", None).await.unwrap();
    wait_for_text(&b, "abc").await;
    next_matching(&mut bob, |u| *u == ClientUpdate::Text("abc".into())).await;

    b.edit("bob", ">abc", Some(1)).await.unwrap();
    wait_for_text(&a, ">abc").await;
    a.edit("alice", "abXc", Some(3)).await.unwrap();

    assert_eq!(wait_for_same(&[&a, &b]).await, ">abXc");
}

#[tokio::test]
async fn snapshot_and_revert_replicate() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let mut alice = a.connect("alice").await.unwrap();
    let mut bob = b.connect("bob").await.unwrap();

    a.edit("alice", "hello", Some(5)).await.unwrap();
    wait_for_text(&b, "hello").await;

    let s1 = a.request_snapshot().await.unwrap();
    assert_eq!(a.list_snapshots().await.unwrap(), vec![s1]);
    let update = next_matching(&mut alice, |u| matches!(u, ClientUpdate::Snapshots(_))).await;
    assert_eq!(update, ClientUpdate::Snapshots(vec![s1]));

    next_matching(&mut bob, |u| *u == ClientUpdate::Text("hello".into())).await;
    b.edit("bob", "hello world", Some(11)).await.unwrap();
    wait_for_text(&a, "hello world").await;

    a.request_revert(Some("alice".into()), s1).await.unwrap();
    assert_eq!(a.current_text().await.unwrap(), "hello");
    wait_for_text(&b, "hello").await;
    next_matching(&mut alice, |u| *u == ClientUpdate::FullState("hello".into())).await;
}

#[tokio::test]
async fn unknown_snapshot_reports_to_requester() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let mut alice = a.connect("alice").await.unwrap();
    next(&mut alice).await;

    let err = a.request_revert(Some("alice".into()), SnapshotId(77)).await.unwrap_err();
    assert!(matches!(err, Error::SnapshotNotFound(SnapshotId(77))));
    match next(&mut alice).await {
        ClientUpdate::Error(message) => assert!(message.contains("snap-000077")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn edits_survive_broker_outage() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let _alice = a.connect("alice").await.unwrap();

    broker.set_available(false);
    a.edit("alice", "offline", None).await.unwrap();
    assert_eq!(a.current_text().await.unwrap(), "offline");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(b.current_text().await.unwrap(), "");

    broker.set_available(true);
    wait_for_text(&b, "offline").await;
}

#[tokio::test]
async fn duplicate_delivery_is_harmless() {
    let broker = MemoryBroker::new();
    broker.set_duplicate(true);
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let _alice = a.connect("alice").await.unwrap();

    a.edit("alice", "twice", None).await.unwrap();
    wait_for_text(&b, "twice").await;
    assert_eq!(b.status().await.unwrap().log_len, 5);
}

#[tokio::test]
async fn late_joiner_catches_up() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let _alice = a.connect("alice").await.unwrap();
    let _bob = b.connect("bob").await.unwrap();

    a.edit("alice", "early", None).await.unwrap();
    wait_for_text(&b, "early").await;
    b.edit("bob", "early bird", None).await.unwrap();
    wait_for_text(&a, "early bird").await;

    let c = spawn(&broker, 3).await;
    wait_for_text(&c, "early bird").await;
    assert_eq!(c.status().await.unwrap().pending, 0);
}

#[tokio::test]
async fn late_joiner_catches_up_after_author_leaves() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let _alice = a.connect("alice").await.unwrap();
    let _bob = b.connect("bob").await.unwrap();

    a.edit("alice", "hello", None).await.unwrap();
    wait_for_text(&b, "hello").await;
    b.edit("bob", "hello world", Some(11)).await.unwrap();
    wait_for_text(&a, "hello world").await;
    a.shutdown().await.unwrap();

    // Only b is left to vouch for a's characters.
    let c = spawn(&broker, 3).await;
    wait_for_text(&c, "hello world").await;
    let status = c.status().await.unwrap();
    assert_eq!(status.pending, 0);
    assert_eq!(status.log_len, 11);
    assert_eq!(&status.version, &b.status().await.unwrap().version);
}

#[tokio::test]
async fn compacted_history_reaches_late_joiner() {
    let broker = MemoryBroker::new();
    let mut compacting = config();
    compacting.snapshot.compact_log = true;
    let a = spawn_with(&broker, 1, &compacting).await;
    let _alice = a.connect("alice").await.unwrap();

    a.edit("alice", "hello", None).await.unwrap();
    a.request_snapshot().await.unwrap();
    assert_eq!(a.status().await.unwrap().log_len, 0);

    let c = spawn(&broker, 3).await;
    let mut carol = c.connect("carol").await.unwrap();
    wait_for_text(&c, "hello").await;
    next_matching(&mut carol, |u| *u == ClientUpdate::FullState("hello".into())).await;

    // Later edits build on the installed state in both directions.
    a.edit("alice", "hello!", Some(6)).await.unwrap();
    next_matching(&mut carol, |u| *u == ClientUpdate::Text("hello!".into())).await;
    c.edit("carol", ">hello!", Some(1)).await.unwrap();
    wait_for_text(&a, ">hello!").await;
    assert_eq!(c.status().await.unwrap().pending, 0);
}

#[tokio::test]
async fn missing_dependency_times_out_into_resync() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let mut alice = a.connect("alice").await.unwrap();
    assert_eq!(next(&mut alice).await, ClientUpdate::FullState(String::new()));

    // The first of these never arrives.
    let mut author = Document::new(ReplicaKey::from_secret([9; 32]), 4);
    let ops = author.insert_str_local(0, "ab").unwrap();
    assert_eq!(a.deliver(ops[1].clone()).await.unwrap(), Delivery::Buffered);
    assert_eq!(a.status().await.unwrap().pending, 1);

    let update = next_matching(&mut alice, |u| matches!(u, ClientUpdate::FullState(_))).await;
    assert_eq!(update, ClientUpdate::FullState(String::new()));
    assert_eq!(a.status().await.unwrap().pending, 0);
    assert_eq!(a.current_text().await.unwrap(), "");
}

#[tokio::test]
async fn damaged_sequence_is_rebuilt_from_log() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let mut alice = a.connect("alice").await.unwrap();
    assert_eq!(next(&mut alice).await, ClientUpdate::FullState(String::new()));
    a.edit("alice", "keep", None).await.unwrap();

    let bad = Operation {
        replica: ReplicaKey::from_secret([9; 32]).id(),
        seq: 1,
        kind: OpKind::Delete { id: Identifier::HEAD },
    };
    let err = a.deliver(bad).await.unwrap_err();
    assert!(matches!(err, Error::Inconsistent(_)));

    next_matching(&mut alice, |u| *u == ClientUpdate::FullState("keep".into())).await;
    assert_eq!(a.current_text().await.unwrap(), "keep");
    assert_eq!(a.status().await.unwrap().log_len, 4);
}

#[tokio::test]
async fn lost_subscription_recovers() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let _alice = a.connect("alice").await.unwrap();

    broker.disconnect_subscribers();
    a.edit("alice", "missed?", None).await.unwrap();
    wait_for_text(&b, "missed?").await;
}

#[tokio::test]
async fn disconnect_stops_updates_only() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let b = spawn(&broker, 2).await;
    let _alice = a.connect("alice").await.unwrap();
    let bob = b.connect("bob").await.unwrap();

    b.disconnect("bob").await.unwrap();
    a.edit("alice", "still here", None).await.unwrap();
    wait_for_text(&b, "still here").await;
    assert_eq!(b.status().await.unwrap().clients, 0);
    drop(bob);
}

#[tokio::test]
async fn catch_up_and_deliver() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    let _alice = a.connect("alice").await.unwrap();
    a.edit("alice", "xyz", None).await.unwrap();

    // A coordinator on another topic sees nothing until fed by hand.
    let other: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let d = Coordinator::spawn("elsewhere", ReplicaKey::from_secret([4; 32]), other, &config()).await;
    let ops = a.catch_up(d.status().await.unwrap().version).await.unwrap();
    assert_eq!(ops.len(), 3);
    for op in ops.into_iter().rev() {
        d.deliver(op).await.unwrap();
    }
    assert_eq!(d.current_text().await.unwrap(), "xyz");
}

#[tokio::test]
async fn shutdown_closes_handle() {
    let broker = MemoryBroker::new();
    let a = spawn(&broker, 1).await;
    a.shutdown().await.unwrap();
    assert!(matches!(a.current_text().await, Err(Error::CoordinatorClosed)));
}
