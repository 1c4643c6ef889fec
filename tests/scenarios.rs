//! Concrete replication scenarios between a handful of replicas.

use std::time::Instant;

use cowrite::crdt::Crdt;
use cowrite::crdt::op::OpKind;
use cowrite::document::Delivery;
use cowrite::document::Document;
use cowrite::key::ReplicaKey;
use cowrite::snapshot::SnapshotStore;

fn replica(n: u8) -> Document {
    return Document::new(ReplicaKey::from_secret([n; 32]), 64);
}

fn deliver(doc: &mut Document, ops: &[cowrite::crdt::op::Operation]) {
    for op in ops {
        doc.apply_remote(op.clone(), Instant::now()).unwrap();
    }
}

#[test]
fn concurrent_inserts_at_one_gap_order_by_id() {
    let mut a = replica(1);
    let mut b = replica(2);
    deliver(&mut b, &a.insert_str_local(0, "ac").unwrap());

    let x = a.insert_local(1, 'x').unwrap();
    let y = b.insert_local(1, 'y').unwrap();
    let (x_id, y_id) = (x.inserts()[0].id, y.inserts()[0].id);
    assert_eq!(x.inserts()[0].origin_left, y.inserts()[0].origin_left);
    assert_eq!(x.inserts()[0].origin_right, y.inserts()[0].origin_right);

    deliver(&mut a, &[y]);
    deliver(&mut b, &[x]);

    let expected = if x_id > y_id { "axyc" } else { "ayxc" };
    assert_eq!(a.materialize(), expected);
    assert_eq!(b.materialize(), expected);
}

#[test]
fn insert_waits_for_its_left_origin() {
    let mut a = replica(1);
    let mut b = replica(2);
    let mut c = replica(3);

    let first = a.insert_local(0, 'h').unwrap();
    deliver(&mut b, &[first.clone()]);
    let second = b.insert_local(1, 'i').unwrap();

    // c sees b's insert, whose left origin it has never seen.
    assert_eq!(c.apply_remote(second.clone(), Instant::now()).unwrap(), Delivery::Buffered);
    assert_eq!(c.materialize(), "");

    let delivery = c.apply_remote(first.clone(), Instant::now()).unwrap();
    assert_eq!(delivery, Delivery::Applied(vec![first, second]));
    assert_eq!(c.materialize(), "hi");
}

#[test]
fn delete_before_insert_arrives() {
    let mut a = replica(1);
    let mut b = replica(2);
    let mut c = replica(3);

    let insert = a.insert_local(0, 'z').unwrap();
    deliver(&mut b, &[insert.clone()]);
    let delete = b.delete_local(0).unwrap();
    assert!(matches!(delete.kind, OpKind::Delete { .. }));

    assert_eq!(c.apply_remote(delete, Instant::now()).unwrap(), Delivery::Buffered);
    deliver(&mut c, &[insert.clone()]);

    let id = insert.inserts()[0].id;
    assert_eq!(c.materialize(), "");
    assert!(c.sequence().contains(&id));
    assert!(!c.sequence().is_live(&id));
}

#[test]
fn repeated_deletes_of_one_element() {
    let mut a = replica(1);
    let mut b = replica(2);
    let inserts = a.insert_str_local(0, "ab").unwrap();
    deliver(&mut b, &inserts);

    let from_a = a.delete_local(0).unwrap();
    let from_b = b.delete_local(0).unwrap();
    deliver(&mut a, &[from_b.clone(), from_b]);
    deliver(&mut b, &[from_a.clone(), from_a]);

    assert_eq!(a.materialize(), "b");
    assert_eq!(b.materialize(), "b");
    assert_eq!(a.sequence().export(), b.sequence().export());
}

#[test]
fn snapshot_revert_reaches_log_only_replica() {
    let mut a = replica(1);
    let mut store = SnapshotStore::new();

    a.insert_str_local(0, "hello").unwrap();
    let s1 = store.create(&a).id;
    a.insert_str_local(5, " world").unwrap();
    assert_eq!(a.materialize(), "hello world");

    let revert = a.replace_local(store.text_of(s1).unwrap()).unwrap();
    assert!(matches!(revert.kind, OpKind::Replace { .. }));
    assert_eq!(a.materialize(), "hello");

    // Rebuilt from the log alone.
    let c = Document::from_log(ReplicaKey::from_secret([3; 32]), a.log(), 64).unwrap();
    assert_eq!(c.materialize(), "hello");

    // Or fed the log backwards as remote operations.
    let mut d = replica(4);
    let mut ops = a.log().entries().to_vec();
    ops.reverse();
    deliver(&mut d, &ops);
    assert_eq!(d.materialize(), "hello");
    assert_eq!(d.sequence().export(), a.sequence().export());
}

#[test]
fn revert_keeps_edits_made_concurrently() {
    let mut a = replica(1);
    let mut b = replica(2);
    let mut store = SnapshotStore::new();

    deliver(&mut b, &a.insert_str_local(0, "one").unwrap());
    let s1 = store.create(&a).id;
    deliver(&mut b, &a.insert_str_local(3, " two").unwrap());

    let revert = a.replace_local(store.text_of(s1).unwrap()).unwrap();
    let typed = b.insert_str_local(0, ">").unwrap();
    deliver(&mut a, &typed);
    deliver(&mut b, &[revert]);

    assert_eq!(a.materialize(), b.materialize());
    assert!(a.materialize().contains("one"));
    assert!(a.materialize().contains('>'));
    assert!(!a.materialize().contains("two"));
}

#[test]
fn late_joiner_catches_up_from_version() {
    let mut a = replica(1);
    let mut b = replica(2);
    deliver(&mut b, &a.insert_str_local(0, "abc").unwrap());
    deliver(&mut a, &b.insert_str_local(3, "def").unwrap());

    let mut c = replica(3);
    let missing = a.catch_up(c.version()).unwrap();
    deliver(&mut c, &missing);
    assert_eq!(c.materialize(), a.materialize());

    let nothing = a.catch_up(c.version()).unwrap();
    assert!(nothing.is_empty());
}

#[test]
fn state_merge_converges_both_ways() {
    let mut a = replica(1);
    let mut b = replica(2);
    let mut c = replica(3);
    a.insert_str_local(0, "alpha").unwrap();
    b.insert_str_local(0, "beta").unwrap();
    c.insert_str_local(0, "gamma").unwrap();

    a.merge(&b);
    b.merge(&c);
    c.merge(&a);
    a.merge(&c);
    b.merge(&a);

    assert_eq!(a.materialize(), b.materialize());
    assert_eq!(b.materialize(), c.materialize());
    assert_eq!(a.len(), "alphabetagamma".len());
}

#[test]
fn signed_operations_survive_the_wire() {
    let key = ReplicaKey::from_secret([5; 32]);
    let mut a = Document::new(key.clone(), 8);
    let op = a.insert_local(0, 'q').unwrap();

    let bytes = op.clone().sign(&key).unwrap().encode().unwrap();
    let decoded = cowrite::crdt::op::SignedOperation::decode(&bytes).unwrap();
    decoded.verify().unwrap();
    assert_eq!(decoded.op, op);

    let mut b = replica(6);
    deliver(&mut b, &[decoded.op]);
    assert_eq!(b.materialize(), "q");
}
