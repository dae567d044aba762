#![allow(missing_docs)]

mod support;

use std::time::Duration;

use emberkv::{Cas, Cookie, DocKey, EvictionPolicy, Item, Status, VBucketState, Vbid};
use support::{open_bucket, open_bucket_with, test_config, wait_persisted, wait_until};
use tempfile::tempdir;

fn item(vb: u16, key: &str, value: &str) -> Item {
    Item::new(Vbid(vb), DocKey::from(key), value.as_bytes().to_vec())
}

#[test]
fn evicted_value_is_fetched_back_on_demand() {
    let dir = tempdir().unwrap();
    let (bucket, sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("cold");

    bucket.set(item(0, "cold", "chilly"), Cas::WILDCARD, Cookie(1));
    assert!(wait_persisted(&bucket, 1));

    // Dirty items may not be evicted; persisted ones may.
    assert!(wait_until(Duration::from_secs(5), || {
        bucket.evict_key(Vbid(0), &key) == Status::Success
    }));
    let vb = bucket.vbucket(Vbid(0)).unwrap();
    assert_eq!(vb.ht().num_non_resident(), 1);
    assert!(bucket.stats().num_value_ejects >= 1);

    let cookie = Cookie(5);
    let blocked = bucket.get(Vbid(0), &key, cookie);
    assert_eq!(blocked.status, Status::WouldBlock);
    assert_eq!(sink.wait_for(cookie, Duration::from_secs(10)), Some(Status::Success));

    let got = bucket.get(Vbid(0), &key, cookie);
    assert_eq!(got.status, Status::Success);
    assert_eq!(got.value.as_deref(), Some(b"chilly".as_ref()));
    assert!(bucket.stats().bg_fetched >= 1);
    assert_eq!(vb.ht().num_non_resident(), 0);
    bucket.shutdown();
}

#[test]
fn dirty_items_are_never_evicted() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    bucket.stop_persistence();
    bucket.set(item(0, "dirty", "v"), Cas::WILDCARD, Cookie(1));
    assert_eq!(bucket.evict_key(Vbid(0), &DocKey::from("dirty")), Status::TempFailure);
    assert!(bucket.stats().num_eject_failures >= 1);
    bucket.start_persistence();
    bucket.shutdown();
}

#[test]
fn full_eviction_meta_fetches_and_bloom_short_circuit() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.item_eviction_policy = EvictionPolicy::FullEviction;
    config.bfilter_enabled = true;
    let (bucket, sink) = open_bucket_with(config);
    assert_eq!(bucket.set_vbucket_state(Vbid(0), VBucketState::Active), Status::Success);

    for i in 0..10 {
        let stored = bucket.set(item(0, &format!("fe-{i}"), "v"), Cas::WILDCARD, Cookie(1));
        assert_eq!(stored.status, Status::Success);
    }
    assert!(wait_persisted(&bucket, 10));
    for i in 0..10 {
        let key = DocKey::from(format!("fe-{i}").as_str());
        assert!(wait_until(Duration::from_secs(5), || {
            bucket.evict_key(Vbid(0), &key) == Status::Success
        }));
    }
    let vb = bucket.vbucket(Vbid(0)).unwrap();
    assert_eq!(vb.ht().num_items(), 0, "full eviction unlinks records");
    assert_eq!(vb.ht().num_total_items(), 10, "items still counted on disk");

    // Metadata comes back via background meta fetches.
    let meta_fetched_before = bucket.stats().bg_meta_fetched;
    for i in 0..10 {
        let key = DocKey::from(format!("fe-{i}").as_str());
        let cookie = Cookie(100 + i);
        let blocked = bucket.get_meta(Vbid(0), &key, cookie);
        assert_eq!(blocked.status, Status::WouldBlock);
        assert_eq!(sink.wait_for(cookie, Duration::from_secs(10)), Some(Status::Success));
        let meta = bucket.get_meta(Vbid(0), &key, cookie);
        assert_eq!(meta.status, Status::Success);
        assert!(!meta.deleted);
    }
    assert_eq!(bucket.stats().bg_meta_fetched, meta_fetched_before + 10);

    // A never-stored key is rejected by the bloom filter: no disk probe.
    let fetches_before = bucket.stats();
    let ghost = bucket.get_meta(Vbid(0), &DocKey::from("never-stored"), Cookie(999));
    assert_eq!(ghost.status, Status::KeyNotFound);
    let after = bucket.stats();
    assert_eq!(after.bg_meta_fetched, fetches_before.bg_meta_fetched);
    assert_eq!(after.bg_fetched, fetches_before.bg_fetched);
    assert!(after.bloom_filter_skips > fetches_before.bloom_filter_skips);
    bucket.shutdown();
}

#[test]
fn item_pager_frees_memory_down_to_the_low_water_mark() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.max_size = 4 * 1024 * 1024;
    config.mem_high_wat = 512 * 1024;
    config.mem_low_wat = 256 * 1024;
    config.chk_max_items = 10;
    config.pager_sleep_time = Duration::from_millis(100);
    let (bucket, _sink) = open_bucket_with(config);
    assert_eq!(bucket.set_vbucket_state(Vbid(0), VBucketState::Active), Status::Success);

    let payload = "x".repeat(4096);
    for i in 0..300 {
        let stored = bucket.set(item(0, &format!("bulk-{i}"), &payload), Cas::WILDCARD, Cookie(1));
        assert_eq!(stored.status, Status::Success, "write {i} failed");
    }
    assert!(wait_persisted(&bucket, 300));

    assert!(
        wait_until(Duration::from_secs(20), || {
            bucket.stats().mem_used <= bucket.config().mem_low_wat
        }),
        "pager never reached the low water mark (mem_used={})",
        bucket.stats().mem_used
    );
    assert!(bucket.stats().num_value_ejects > 0);
    assert!(bucket.stats().num_pager_runs >= 1);

    // Everything is still readable, paged back in from disk as needed.
    let got = bucket.get(Vbid(0), &DocKey::from("bulk-0"), Cookie(1));
    assert!(matches!(got.status, Status::Success | Status::WouldBlock));
    bucket.shutdown();
}
