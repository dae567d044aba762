#![allow(missing_docs)]

mod support;

use std::time::Duration;

use emberkv::{Cas, Cookie, Datatype, DocKey, Item, Status, Vbid};
use support::{
    open_bucket, open_bucket_with, test_config, wait_persisted, wait_seqno_persisted, wait_until,
    wait_warmed_up,
};
use tempfile::tempdir;

fn item(vb: u16, key: &str, value: &str) -> Item {
    Item::new(Vbid(vb), DocKey::from(key), value.as_bytes().to_vec())
}

#[test]
fn restart_restores_one_hundred_documents() {
    let dir = tempdir().unwrap();
    {
        let (bucket, _sink) = open_bucket(dir.path(), 1);
        for i in 0..100 {
            let stored =
                bucket.set(item(0, &format!("key-{i}"), "somevalue"), Cas::WILDCARD, Cookie(1));
            assert_eq!(stored.status, Status::Success);
        }
        assert!(wait_persisted(&bucket, 100), "flusher never caught up");
        bucket.shutdown();
    }

    let (bucket, _sink) = open_bucket_with(test_config(dir.path()));
    assert!(wait_warmed_up(&bucket), "warmup did not finish");
    let got = bucket.get(Vbid(0), &DocKey::from("key-42"), Cookie(1));
    assert_eq!(got.status, Status::Success);
    assert_eq!(got.value.as_deref(), Some(b"somevalue".as_ref()));
    assert_eq!(bucket.vbucket(Vbid(0)).unwrap().ht().num_items(), 100);
    assert!(bucket.stats().warmed_up_keys >= 100);
    bucket.shutdown();
}

#[test]
fn metadata_survives_restart_byte_for_byte() {
    let dir = tempdir().unwrap();
    let key = DocKey::from("precious");
    let (cas, rev, exptime);
    {
        let (bucket, _sink) = open_bucket(dir.path(), 1);
        let far = emberkv::item::unix_now() + 86_400;
        let stored = bucket.set(
            item(0, "precious", r#"{"v":1}"#)
                .with_flags(0xdead_beef)
                .with_exptime(far)
                .with_datatype(Datatype::JSON),
            Cas::WILDCARD,
            Cookie(1),
        );
        assert_eq!(stored.status, Status::Success);
        let meta = bucket.get_meta(Vbid(0), &key, Cookie(1)).meta;
        cas = meta.cas;
        rev = meta.rev_seqno;
        exptime = far;
        assert!(wait_persisted(&bucket, 1));
        bucket.shutdown();
    }

    let (bucket, _sink) = open_bucket_with(test_config(dir.path()));
    assert!(wait_warmed_up(&bucket));
    let meta = bucket.get_meta(Vbid(0), &key, Cookie(1));
    assert_eq!(meta.status, Status::Success);
    assert_eq!(meta.meta.cas, cas);
    assert_eq!(meta.meta.rev_seqno, rev);
    assert_eq!(meta.meta.exptime, exptime);
    assert_eq!(meta.meta.flags, 0xdead_beef);
    assert_eq!(meta.meta.datatype, Datatype::JSON);
    let got = bucket.get(Vbid(0), &key, Cookie(1));
    assert_eq!(got.cas, cas);
    assert_eq!(got.value.as_deref(), Some(br#"{"v":1}"#.as_ref()));

    // CAS values stay monotonic across the restart.
    let next = bucket.set(item(0, "precious", "v2"), Cas::WILDCARD, Cookie(1));
    assert!(next.cas > cas);
    bucket.shutdown();
}

#[test]
fn tombstones_survive_restart() {
    let dir = tempdir().unwrap();
    let key = DocKey::from("buried");
    {
        let (bucket, _sink) = open_bucket(dir.path(), 1);
        bucket.set(item(0, "buried", "v"), Cas::WILDCARD, Cookie(1));
        let deleted = bucket.delete(Vbid(0), &key, Cas::WILDCARD, Cookie(1));
        assert_eq!(deleted.status, Status::Success);
        assert!(wait_seqno_persisted(&bucket, Vbid(0), 2));
        bucket.shutdown();
    }

    let (bucket, _sink) = open_bucket_with(test_config(dir.path()));
    assert!(wait_warmed_up(&bucket));
    assert_eq!(bucket.get(Vbid(0), &key, Cookie(1)).status, Status::KeyNotFound);
    bucket.shutdown();
}

#[test]
fn observe_seqno_reports_failover_after_restart() {
    let dir = tempdir().unwrap();
    let old_uuid;
    {
        let (bucket, _sink) = open_bucket(dir.path(), 1);
        for i in 0..10 {
            bucket.set(item(0, &format!("doc-{i}"), "v"), Cas::WILDCARD, Cookie(1));
        }
        assert!(wait_persisted(&bucket, 10));
        old_uuid = bucket.vbucket(Vbid(0)).unwrap().failover_latest().vb_uuid;

        let same = bucket.observe_seqno(Vbid(0), old_uuid).unwrap();
        assert!(!same.failed_over);
        assert_eq!(same.current_seqno, 10);
        bucket.shutdown();
    }

    let (bucket, _sink) = open_bucket_with(test_config(dir.path()));
    assert!(wait_warmed_up(&bucket));
    let obs = bucket.observe_seqno(Vbid(0), old_uuid).unwrap();
    assert!(obs.failed_over, "restart must open a new lineage");
    assert_ne!(obs.vb_uuid, old_uuid);
    assert_eq!(obs.last_persisted_seqno, 10);
    assert_eq!(obs.current_seqno, 10);
    assert_eq!(obs.old_vb_uuid, Some(old_uuid));
    assert_eq!(obs.old_seqno, Some(10));

    let encoded = obs.encode(Vbid(0));
    assert_eq!(encoded.len(), 43);
    assert_eq!(encoded[0], 1);
    bucket.shutdown();
}

#[test]
fn stop_persistence_parks_the_flusher() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);

    bucket.set(item(0, "before", "v"), Cas::WILDCARD, Cookie(1));
    assert!(wait_persisted(&bucket, 1));

    bucket.stop_persistence();
    bucket.set(item(0, "parked", "v"), Cas::WILDCARD, Cookie(1));
    std::thread::sleep(Duration::from_millis(600));
    let stalled = bucket.stats().total_persisted;

    bucket.start_persistence();
    assert!(wait_until(Duration::from_secs(15), || bucket.stats().total_persisted > stalled));
    bucket.shutdown();
}

#[test]
fn vbucket_state_record_round_trips_replica() {
    let dir = tempdir().unwrap();
    {
        let (bucket, _sink) = open_bucket(dir.path(), 1);
        assert_eq!(
            bucket.set_vbucket_state(Vbid(1), emberkv::VBucketState::Replica),
            Status::Success
        );
        bucket.shutdown();
    }
    let (bucket, _sink) = open_bucket_with(test_config(dir.path()));
    assert!(wait_until(Duration::from_secs(15), || {
        bucket.get_vbucket_state(Vbid(1)).is_some()
    }));
    assert_eq!(bucket.get_vbucket_state(Vbid(1)), Some(emberkv::VBucketState::Replica));
    bucket.shutdown();
}
