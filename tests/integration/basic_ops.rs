#![allow(missing_docs)]

mod support;

use std::time::Duration;

use bytes::Bytes;
use emberkv::{Cas, Cookie, Datatype, DocKey, Item, Status, Vbid};
use support::{open_bucket, wait_until};
use tempfile::tempdir;

fn item(vb: u16, key: &str, value: &str) -> Item {
    Item::new(Vbid(vb), DocKey::from(key), value.as_bytes().to_vec())
}

#[test]
fn set_then_get_returns_value_and_cas() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);

    let stored = bucket.set(item(0, "k1", "v1"), Cas::WILDCARD, Cookie(1));
    assert_eq!(stored.status, Status::Success);
    assert_ne!(stored.cas, Cas::WILDCARD);

    let got = bucket.get(Vbid(0), &DocKey::from("k1"), Cookie(1));
    assert_eq!(got.status, Status::Success);
    assert_eq!(got.value.as_deref(), Some(b"v1".as_ref()));
    assert_eq!(got.cas, stored.cas);
    bucket.shutdown();
}

#[test]
fn cas_mismatch_is_rejected() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);

    let first = bucket.set(item(0, "k", "v1"), Cas::WILDCARD, Cookie(1));
    assert_eq!(first.status, Status::Success);

    let stale = Cas(first.cas.0 ^ 1);
    let rejected = bucket.set(item(0, "k", "v2"), stale, Cookie(1));
    assert_eq!(rejected.status, Status::KeyExists);

    let accepted = bucket.set(item(0, "k", "v3"), first.cas, Cookie(1));
    assert_eq!(accepted.status, Status::Success);
    assert!(accepted.cas > first.cas, "cas must move forward");

    let missing = bucket.set(item(0, "nope", "v"), Cas(1234), Cookie(1));
    assert_eq!(missing.status, Status::KeyNotFound);
    bucket.shutdown();
}

#[test]
fn add_and_replace_semantics() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);

    assert_eq!(bucket.replace(item(0, "a", "v"), Cas::WILDCARD, Cookie(1)).status, Status::KeyNotFound);
    assert_eq!(bucket.add(item(0, "a", "v1"), Cookie(1)).status, Status::Success);
    assert_eq!(bucket.add(item(0, "a", "v2"), Cookie(1)).status, Status::KeyExists);
    assert_eq!(bucket.replace(item(0, "a", "v3"), Cas::WILDCARD, Cookie(1)).status, Status::Success);

    let got = bucket.get(Vbid(0), &DocKey::from("a"), Cookie(1));
    assert_eq!(got.value.as_deref(), Some(b"v3".as_ref()));
    bucket.shutdown();
}

#[test]
fn delete_then_add_revives_with_higher_revision() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("reborn");
    // Keep the tombstone in memory: a persisted tombstone is dropped
    // from the table by the flusher callback.
    bucket.stop_persistence();

    bucket.set(item(0, "reborn", "v1"), Cas::WILDCARD, Cookie(1));
    let before = bucket.get_meta(Vbid(0), &key, Cookie(1));
    assert_eq!(before.status, Status::Success);
    assert!(!before.deleted);

    let deleted = bucket.delete(Vbid(0), &key, Cas::WILDCARD, Cookie(1));
    assert_eq!(deleted.status, Status::Success);
    assert_eq!(bucket.get(Vbid(0), &key, Cookie(1)).status, Status::KeyNotFound);

    let tomb = bucket.get_meta(Vbid(0), &key, Cookie(1));
    assert!(tomb.deleted);
    assert!(tomb.meta.rev_seqno > before.meta.rev_seqno);

    // Tombstone still in the table: add succeeds and bumps the revision.
    let revived = bucket.add(item(0, "reborn", "v2"), Cookie(1));
    assert_eq!(revived.status, Status::Success);
    let after = bucket.get_meta(Vbid(0), &key, Cookie(1));
    assert!(!after.deleted);
    assert!(after.meta.rev_seqno > tomb.meta.rev_seqno);
    bucket.shutdown();
}

#[test]
fn getl_blocks_mutations_until_unlock_or_expiry() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("locked");

    bucket.set(item(0, "locked", "v"), Cas::WILDCARD, Cookie(1));
    let locked = bucket.get_locked(Vbid(0), &key, Duration::from_secs(1), Cookie(1));
    assert_eq!(locked.status, Status::Success);

    // Another GETL while locked fails.
    assert_eq!(
        bucket.get_locked(Vbid(0), &key, Duration::from_secs(1), Cookie(2)).status,
        Status::Locked
    );
    // Plain reads see the lock sentinel instead of the real CAS.
    let read = bucket.get(Vbid(0), &key, Cookie(2));
    assert_eq!(read.cas, Cas::LOCKED);
    // Mutations without the lock-holder's CAS are refused.
    assert_eq!(bucket.set(item(0, "locked", "x"), Cas::WILDCARD, Cookie(2)).status, Status::Locked);
    assert_eq!(bucket.delete(Vbid(0), &key, Cas::WILDCARD, Cookie(2)).status, Status::Locked);
    // Wrong-cas unlock is refused, right-cas unlock releases.
    assert_eq!(bucket.unlock(Vbid(0), &key, Cas(locked.cas.0 ^ 1), Cookie(2)), Status::Locked);
    assert_eq!(bucket.unlock(Vbid(0), &key, locked.cas, Cookie(2)), Status::Success);
    assert_eq!(bucket.set(item(0, "locked", "y"), Cas::WILDCARD, Cookie(2)).status, Status::Success);

    // A lock left to expire releases on its own.
    let relocked = bucket.get_locked(Vbid(0), &key, Duration::from_secs(1), Cookie(1));
    assert_eq!(relocked.status, Status::Success);
    assert!(wait_until(Duration::from_secs(3), || {
        bucket.get_locked(Vbid(0), &key, Duration::from_secs(1), Cookie(1)).status
            == Status::Success
    }));
    bucket.shutdown();
}

#[test]
fn unlock_of_unlocked_key_is_a_temp_failure() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    bucket.set(item(0, "free", "v"), Cas::WILDCARD, Cookie(1));
    assert_eq!(bucket.unlock(Vbid(0), &DocKey::from("free"), Cas(1), Cookie(1)), Status::TempFailure);
    bucket.shutdown();
}

#[test]
fn touch_and_gat_refresh_expiry() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("ttl");
    let soon = emberkv::item::unix_now() + 2;

    bucket.set(item(0, "ttl", "v").with_exptime(soon), Cas::WILDCARD, Cookie(1));
    // Push the expiry far out before it fires.
    let touched = bucket.touch(Vbid(0), &key, emberkv::item::unix_now() + 3600, Cookie(1));
    assert_eq!(touched.status, Status::Success);
    std::thread::sleep(Duration::from_millis(2500));
    assert_eq!(bucket.get(Vbid(0), &key, Cookie(1)).status, Status::Success);

    let gat = bucket.get_and_touch(Vbid(0), &key, 0, Cookie(1));
    assert_eq!(gat.status, Status::Success);
    assert_eq!(gat.value.as_deref(), Some(b"v".as_ref()));
    let meta = bucket.get_meta(Vbid(0), &key, Cookie(1));
    assert_eq!(meta.meta.exptime, 0);
    bucket.shutdown();
}

#[test]
fn datatype_and_flags_round_trip() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let stored = bucket.set(
        item(0, "doc", r#"{"a":1}"#).with_datatype(Datatype::JSON).with_flags(0xfeed_f00d),
        Cas::WILDCARD,
        Cookie(1),
    );
    assert_eq!(stored.status, Status::Success);
    let got = bucket.get(Vbid(0), &DocKey::from("doc"), Cookie(1));
    assert_eq!(got.datatype, Datatype::JSON);
    assert_eq!(got.flags, 0xfeed_f00d);
    bucket.shutdown();
}

#[test]
fn random_key_and_ranged_key_scan() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    for i in 0..20 {
        bucket.set(item(0, &format!("scan-{i:02}"), "v"), Cas::WILDCARD, Cookie(1));
    }

    let (vb, key) = bucket.get_random_key().expect("some key");
    assert_eq!(vb, Vbid(0));
    assert!(key.to_string().starts_with("scan-"));

    let keys = bucket.get_keys(Vbid(0), &DocKey::from("scan-10"), 5).unwrap();
    assert_eq!(keys.len(), 5);
    assert_eq!(keys[0], DocKey::from("scan-10"));
    assert_eq!(keys[4], DocKey::from("scan-14"));
    bucket.shutdown();
}

#[test]
fn randomized_mixed_workload_matches_a_model() {
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0x5eed);
    let mut model: HashMap<u16, String> = HashMap::new();

    for op in 0..2000 {
        let keynum: u16 = rng.gen_range(0..64);
        let key = DocKey::from(format!("mix-{keynum}").as_str());
        if rng.gen_bool(0.7) {
            let value = format!("v{op}");
            let out = bucket.set(item(0, &format!("mix-{keynum}"), &value), Cas::WILDCARD, Cookie(1));
            assert_eq!(out.status, Status::Success);
            model.insert(keynum, value);
        } else {
            let out = bucket.delete(Vbid(0), &key, Cas::WILDCARD, Cookie(1));
            let expected =
                if model.remove(&keynum).is_some() { Status::Success } else { Status::KeyNotFound };
            assert_eq!(out.status, expected, "op {op} delete mix-{keynum}");
        }
    }

    for keynum in 0..64u16 {
        let key = DocKey::from(format!("mix-{keynum}").as_str());
        let got = bucket.get(Vbid(0), &key, Cookie(1));
        match model.get(&keynum) {
            Some(value) => {
                assert_eq!(got.status, Status::Success, "mix-{keynum}");
                assert_eq!(got.value.as_deref(), Some(value.as_bytes()));
            }
            None => assert_eq!(got.status, Status::KeyNotFound, "mix-{keynum}"),
        }
    }
    let vb = bucket.vbucket(Vbid(0)).unwrap();
    assert_eq!(
        vb.ht().num_items() - vb.ht().num_deleted_items(),
        model.len(),
        "live item count must match the model"
    );
    bucket.shutdown();
}

#[test]
fn cluster_config_blob_round_trips() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    assert!(bucket.get_cluster_config().is_empty());
    bucket.set_cluster_config(Bytes::from_static(b"{\"rev\":7}"));
    assert_eq!(bucket.get_cluster_config().as_ref(), b"{\"rev\":7}");
    bucket.shutdown();
}

#[test]
fn set_with_meta_conflict_resolution() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("xdcr");

    let stored = bucket.set(item(0, "xdcr", "local"), Cas::WILDCARD, Cookie(1));
    assert_eq!(stored.status, Status::Success);
    let local = bucket.get_meta(Vbid(0), &key, Cookie(1)).meta;
    let seqno_before = bucket.vbucket(Vbid(0)).unwrap().high_seqno();

    // Lower incoming revision: conflict-resolved away, seqno untouched.
    let mut losing = item(0, "xdcr", "remote-stale");
    losing.meta.rev_seqno = 0;
    losing.meta.cas = Cas(1);
    let skipped = bucket.set_with_meta(losing, Cas::WILDCARD, Cookie(1), false);
    assert_eq!(skipped.status, Status::KeyExists);
    assert_eq!(bucket.vbucket(Vbid(0)).unwrap().high_seqno(), seqno_before);
    assert_eq!(
        bucket.get(Vbid(0), &key, Cookie(1)).value.as_deref(),
        Some(b"local".as_ref())
    );

    // Higher incoming revision wins and keeps its metadata.
    let mut winning = item(0, "xdcr", "remote-new");
    winning.meta.rev_seqno = local.rev_seqno + 5;
    winning.meta.cas = Cas(local.cas.0 + 1000);
    let accepted = bucket.set_with_meta(winning, Cas::WILDCARD, Cookie(1), false);
    assert_eq!(accepted.status, Status::Success);
    let now = bucket.get_meta(Vbid(0), &key, Cookie(1)).meta;
    assert_eq!(now.rev_seqno, local.rev_seqno + 5);
    assert_eq!(now.cas, Cas(local.cas.0 + 1000));

    // Force bypasses resolution entirely.
    let mut forced = item(0, "xdcr", "forced");
    forced.meta.rev_seqno = 1;
    forced.meta.cas = Cas(2);
    assert_eq!(bucket.set_with_meta(forced, Cas::WILDCARD, Cookie(1), true).status, Status::Success);
    assert_eq!(
        bucket.get(Vbid(0), &key, Cookie(1)).value.as_deref(),
        Some(b"forced".as_ref())
    );
    bucket.shutdown();
}

#[test]
fn del_with_meta_applies_remote_tombstone() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("remote-del");
    bucket.stop_persistence();

    bucket.set(item(0, "remote-del", "v"), Cas::WILDCARD, Cookie(1));
    let local = bucket.get_meta(Vbid(0), &key, Cookie(1)).meta;
    let mut meta = local;
    meta.rev_seqno = local.rev_seqno + 1;
    meta.cas = Cas(local.cas.0 + 1);
    let out = bucket.del_with_meta(Vbid(0), &key, meta, Cas::WILDCARD, Cookie(1), false);
    assert_eq!(out.status, Status::Success);
    assert_eq!(bucket.get(Vbid(0), &key, Cookie(1)).status, Status::KeyNotFound);
    let tomb = bucket.get_meta(Vbid(0), &key, Cookie(1));
    assert!(tomb.deleted);
    assert_eq!(tomb.meta.rev_seqno, local.rev_seqno + 1);
    bucket.shutdown();
}

#[test]
fn observe_reports_persistence_lifecycle() {
    let dir = tempdir().unwrap();
    let (bucket, _sink) = open_bucket(dir.path(), 1);
    let key = DocKey::from("watched");

    bucket.set(item(0, "watched", "v"), Cas::WILDCARD, Cookie(1));
    assert!(support::wait_until(Duration::from_secs(15), || {
        let results = bucket.observe(Vbid(0), std::slice::from_ref(&key)).unwrap();
        results[0].state == emberkv::ObserveKeyState::Persisted
    }));

    let absent = bucket.observe(Vbid(0), &[DocKey::from("ghost")]).unwrap();
    assert_eq!(absent[0].state, emberkv::ObserveKeyState::NotFound);

    let encoded = emberkv::encode_observe(Vbid(0), &absent);
    // vb(2) + keylen(2) + "ghost"(5) + state(1) + cas(8)
    assert_eq!(encoded.len(), 18);
    assert_eq!(encoded[9], 0x80);
    bucket.shutdown();
}
