#![allow(missing_docs)]

mod support;

use std::time::Duration;

use emberkv::{Cas, Cookie, DocKey, Item, Status, VBucketState, Vbid};
use support::open_bucket;
use tempfile::tempdir;

fn item(vb: u16, key: &str, value: &str) -> Item {
    Item::new(Vbid(vb), DocKey::from(key), value.as_bytes().to_vec())
}

#[test]
fn pending_vbucket_blocks_then_resumes() {
    let dir = tempdir().unwrap();
    let (bucket, sink) = open_bucket(dir.path(), 1);
    assert_eq!(bucket.set_vbucket_state(Vbid(1), VBucketState::Pending), Status::Success);

    let cookie = Cookie(77);
    let blocked = bucket.set(item(1, "p", "q"), Cas::WILDCARD, cookie);
    assert_eq!(blocked.status, Status::WouldBlock);

    assert_eq!(bucket.set_vbucket_state(Vbid(1), VBucketState::Active), Status::Success);
    let resumed = sink.wait_for(cookie, Duration::from_secs(5));
    assert_eq!(resumed, Some(Status::Success));

    let retry = bucket.set(item(1, "p", "q"), Cas::WILDCARD, cookie);
    assert_eq!(retry.status, Status::Success);
    let got = bucket.get(Vbid(1), &DocKey::from("p"), cookie);
    assert_eq!(got.value.as_deref(), Some(b"q".as_ref()));
    bucket.shutdown();
}

#[test]
fn replica_and_dead_reject_client_ops() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    bucket.set(item(0, "k", "v"), Cas::WILDCARD, Cookie(1));

    assert_eq!(bucket.set_vbucket_state(Vbid(0), VBucketState::Replica), Status::Success);
    assert_eq!(bucket.set(item(0, "k", "v2"), Cas::WILDCARD, Cookie(1)).status, Status::NotMyVbucket);
    assert_eq!(bucket.get(Vbid(0), &DocKey::from("k"), Cookie(1)).status, Status::NotMyVbucket);
    assert!(bucket.stats().vb_ops_reject >= 2);

    assert_eq!(bucket.set_vbucket_state(Vbid(0), VBucketState::Dead), Status::Success);
    assert_eq!(bucket.delete(Vbid(0), &DocKey::from("k"), Cas::WILDCARD, Cookie(1)).status, Status::NotMyVbucket);
    bucket.shutdown();
}

#[test]
fn dead_is_terminal() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    assert_eq!(bucket.set_vbucket_state(Vbid(0), VBucketState::Dead), Status::Success);
    assert_eq!(bucket.set_vbucket_state(Vbid(0), VBucketState::Active), Status::InvalidArgument);
    bucket.shutdown();
}

#[test]
fn transition_to_active_opens_a_new_lineage() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    assert_eq!(bucket.set_vbucket_state(Vbid(2), VBucketState::Replica), Status::Success);
    let vb = bucket.vbucket(Vbid(2)).unwrap();
    let old_uuid = vb.failover_latest().vb_uuid;

    assert_eq!(bucket.set_vbucket_state(Vbid(2), VBucketState::Active), Status::Success);
    assert_ne!(vb.failover_latest().vb_uuid, old_uuid);
    bucket.shutdown();
}

#[test]
fn vbucket_delete_notifies_pending_cookie_exactly_once() {
    let dir = tempdir().unwrap();
    let (bucket, sink) = open_bucket(dir.path(), 1);
    assert_eq!(bucket.set_vbucket_state(Vbid(1), VBucketState::Pending), Status::Success);

    let cookie = Cookie(99);
    assert_eq!(bucket.set(item(1, "inflight", "v"), Cas::WILDCARD, cookie).status, Status::WouldBlock);

    assert_eq!(bucket.delete_vbucket(Vbid(1)), Status::Success);
    assert_eq!(sink.wait_for(cookie, Duration::from_secs(5)), Some(Status::NotMyVbucket));
    // Exactly once: nothing further arrives for this cookie.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.delivered_count(cookie), 0);

    assert_eq!(bucket.get(Vbid(1), &DocKey::from("inflight"), cookie).status, Status::NotMyVbucket);
    bucket.shutdown();
}

#[test]
fn vbucket_delete_removes_the_disk_file() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    bucket.set(item(0, "k", "v"), Cas::WILDCARD, Cookie(1));
    assert!(support::wait_persisted(&bucket, 1));
    assert!(dir.path().join("0.kv").exists());

    assert_eq!(bucket.delete_vbucket(Vbid(0)), Status::Success);
    assert!(!dir.path().join("0.kv").exists());
    assert_eq!(bucket.get_vbucket_state(Vbid(0)), None);
    bucket.shutdown();
}

#[test]
fn seqno_listing_filters_by_state() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 2);
    bucket.set(item(0, "a", "v"), Cas::WILDCARD, Cookie(1));
    bucket.set(item(0, "b", "v"), Cas::WILDCARD, Cookie(1));
    bucket.set(item(1, "c", "v"), Cas::WILDCARD, Cookie(1));
    assert_eq!(bucket.set_vbucket_state(Vbid(1), VBucketState::Replica), Status::Success);

    let all = bucket.get_all_vb_seqnos(None);
    assert_eq!(all.len(), 2);
    assert!(all.contains(&(Vbid(0), 2)));
    assert!(all.contains(&(Vbid(1), 1)));

    let active_only = bucket.get_all_vb_seqnos(Some(VBucketState::Active));
    assert_eq!(active_only, vec![(Vbid(0), 2)]);
    bucket.shutdown();
}
