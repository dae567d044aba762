#![allow(missing_docs)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use emberkv::config::Config;
use emberkv::cookie::{CookieJar, NullSink};
use emberkv::expiry_pager::ExpiryPager;
use emberkv::item::unix_now;
use emberkv::shard::ShardNotifier;
use emberkv::stats::EngineStats;
use emberkv::vbucket::{VBucket, VBucketMap};
use emberkv::{Cas, Cookie, DocKey, Item, Status, VBucketState, Vbid};
use support::{open_bucket, wait_persisted, wait_until};
use tempfile::tempdir;

fn item(vb: u16, key: &str, value: &str) -> Item {
    Item::new(Vbid(vb), DocKey::from(key), value.as_bytes().to_vec())
}

#[test]
fn expired_item_vanishes_on_access() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("e");

    let stored = bucket.set(
        item(0, "e", "x").with_exptime(unix_now() + 2),
        Cas::WILDCARD,
        Cookie(1),
    );
    assert_eq!(stored.status, Status::Success);
    assert_eq!(bucket.get(Vbid(0), &key, Cookie(1)).status, Status::Success);

    std::thread::sleep(Duration::from_secs(3));
    assert_eq!(bucket.get(Vbid(0), &key, Cookie(1)).status, Status::KeyNotFound);
    let stats = bucket.stats();
    assert_eq!(stats.expired_access, 1);
    assert_eq!(stats.vb_active_expired, 1);
    assert_eq!(stats.expired_pager, 0);
    bucket.shutdown();
}

#[test]
fn expiry_pager_reaps_stale_items() {
    let config = Arc::new(Config::compact());
    let stats = Arc::new(EngineStats::default());
    let jar = Arc::new(CookieJar::new(Box::new(NullSink)));
    let vbmap = Arc::new(VBucketMap::new(4));
    let vb = VBucket::new(
        Vbid(0),
        VBucketState::Active,
        Arc::clone(&config),
        Arc::clone(&stats),
        jar,
        ShardNotifier::disconnected(),
    );
    vbmap.set(Arc::clone(&vb));

    let soon = unix_now() + 2;
    for i in 0..5 {
        let out = vb.set(
            item(0, &format!("stale-{i}"), "v").with_exptime(soon),
            Cas::WILDCARD,
            Cookie(1),
        );
        assert_eq!(out.status, Status::Success);
    }
    for i in 0..3 {
        let out = vb.set(item(0, &format!("fresh-{i}"), "v"), Cas::WILDCARD, Cookie(1));
        assert_eq!(out.status, Status::Success);
    }

    let pager = ExpiryPager::new(Arc::clone(&vbmap), config, Arc::clone(&stats));
    assert_eq!(pager.sweep(), 0, "nothing stale yet");

    std::thread::sleep(Duration::from_millis(2500));
    assert_eq!(pager.sweep(), 5);
    assert_eq!(stats.expired_pager(), 5);
    assert_eq!(stats.num_expiry_pager_runs(), 2);
    assert_eq!(vb.ht().num_deleted_items(), 5);
    for i in 0..3 {
        let got = vb.get(&DocKey::from(format!("fresh-{i}").as_str()), Cookie(1));
        assert_eq!(got.status, Status::Success);
    }
    // Deletions got fresh seqnos past the original eight mutations.
    assert_eq!(vb.high_seqno(), 13);
}

#[test]
fn compaction_expires_items_found_on_disk() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);

    let stored = bucket.set(
        item(0, "fossil", "v").with_exptime(unix_now() + 1),
        Cas::WILDCARD,
        Cookie(1),
    );
    assert_eq!(stored.status, Status::Success);
    assert!(wait_persisted(&bucket, 1));

    std::thread::sleep(Duration::from_millis(1500));
    let summary = bucket.compact_db(Vbid(0), 0, false).unwrap();
    assert_eq!(summary.tombstones_purged, 0);
    assert!(wait_until(Duration::from_secs(5), || bucket.stats().expired_compactor == 1));
    assert_eq!(bucket.get(Vbid(0), &DocKey::from("fossil"), Cookie(1)).status, Status::KeyNotFound);
    // The access path did not do the deleting.
    assert_eq!(bucket.stats().expired_access, 0);
    bucket.shutdown();
}
