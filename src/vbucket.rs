//! The vbucket: unit of ownership, ordering, and failover.
//!
//! Owns one hash table, one checkpoint log, a bloom filter, a failover
//! table, and the hybrid logical clock that stamps CAS values. Every
//! mutation runs the same pipeline under the hash-bucket lock: update the
//! table, take the next seqno, stamp a CAS, append to the open checkpoint,
//! mark dirty, notify the flusher.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::bloom::BloomFilter;
use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::cookie::CookieJar;
use crate::error::Result;
use crate::failover::{FailoverEntry, FailoverTable};
use crate::hash_table::{BucketGuard, EjectOutcome, HashTable, StoredValue, TempState};
use crate::hlc::HybridLogicalClock;
use crate::item::{unix_now, Item, ItemMeta};
use crate::kvstore::{
    CompactionConfig, CompactionHooks, CompactionSummary, KvStore, VBucketStateRecord,
};
use crate::shard::ShardNotifier;
use crate::stats::EngineStats;
use crate::types::{Cas, Cookie, Datatype, DocKey, EvictionPolicy, Seqno, Status, VBucketState, Vbid};

/// Result of a read.
#[derive(Clone, Debug)]
pub struct GetOutcome {
    /// Operation status.
    pub status: Status,
    /// Value payload on success.
    pub value: Option<Bytes>,
    /// CAS as visible to the client (lock sentinel while locked).
    pub cas: Cas,
    /// Client flags.
    pub flags: u32,
    /// Datatype bitmask.
    pub datatype: Datatype,
}

impl GetOutcome {
    /// An outcome carrying only a status.
    pub fn fail(status: Status) -> GetOutcome {
        GetOutcome { status, value: None, cas: Cas::WILDCARD, flags: 0, datatype: Datatype::RAW }
    }
}

/// Result of a mutation.
#[derive(Clone, Copy, Debug)]
pub struct MutationOutcome {
    /// Operation status.
    pub status: Status,
    /// CAS of the stored revision on success.
    pub cas: Cas,
    /// Seqno of the stored revision on success.
    pub by_seqno: Seqno,
}

impl MutationOutcome {
    /// An outcome carrying only a status.
    pub fn fail(status: Status) -> MutationOutcome {
        MutationOutcome { status, cas: Cas::WILDCARD, by_seqno: 0 }
    }

    fn ok(cas: Cas, by_seqno: Seqno) -> MutationOutcome {
        MutationOutcome { status: Status::Success, cas, by_seqno }
    }
}

/// Result of a metadata read.
#[derive(Clone, Copy, Debug)]
pub struct MetaOutcome {
    /// Operation status.
    pub status: Status,
    /// Revision metadata on success.
    pub meta: ItemMeta,
    /// Whether the revision is a tombstone.
    pub deleted: bool,
}

impl MetaOutcome {
    /// An outcome carrying only a status.
    pub fn fail(status: Status) -> MetaOutcome {
        MetaOutcome { status, meta: ItemMeta::default(), deleted: false }
    }
}

/// Per-key observe states, as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserveKeyState {
    /// In memory, not yet persisted.
    NotPersisted,
    /// Persisted to disk.
    Persisted,
    /// No trace of the key.
    NotFound,
    /// Deleted; tombstone may still exist on disk.
    LogicallyDeleted,
}

impl ObserveKeyState {
    /// Wire encoding of the state byte.
    pub fn as_u8(self) -> u8 {
        match self {
            ObserveKeyState::NotPersisted => 0x00,
            ObserveKeyState::Persisted => 0x01,
            ObserveKeyState::NotFound => 0x80,
            ObserveKeyState::LogicallyDeleted => 0x81,
        }
    }
}

/// Which path detected an expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpirySource {
    /// A frontend access found the item expired.
    Access,
    /// The expiry pager found it.
    Pager,
    /// Compaction found it.
    Compactor,
}

/// What a store-family operation should do about existing revisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StoreMode {
    Set,
    Add,
    Replace,
}

struct BgFetchWaiter {
    cookies: Vec<Cookie>,
    meta_only: bool,
    queued_at: Instant,
}

/// One entry drained from the background-fetch queue.
pub struct BgFetchJob {
    /// Key to fetch.
    pub key: DocKey,
    /// Cookies to notify on completion.
    pub cookies: Vec<Cookie>,
    /// Whether metadata alone satisfies every waiter.
    pub meta_only: bool,
    /// When the first waiter queued the fetch.
    pub queued_at: Instant,
}

/// A virtual bucket.
pub struct VBucket {
    id: Vbid,
    state: RwLock<VBucketState>,
    ht: HashTable,
    checkpoints: CheckpointManager,
    bloom: BloomFilter,
    failover: RwLock<FailoverTable>,
    hlc: HybridLogicalClock,
    high_seqno: AtomicU64,
    purge_seqno: AtomicU64,
    last_persisted_seqno: AtomicU64,
    last_persisted_snap_start: AtomicU64,
    last_persisted_snap_end: AtomicU64,
    max_deleted_rev: AtomicU64,
    bgfetch_queue: Mutex<FxHashMap<DocKey, BgFetchWaiter>>,
    pending_ops: Mutex<Vec<Cookie>>,
    bucket_creation: AtomicBool,
    config: Arc<Config>,
    stats: Arc<EngineStats>,
    jar: Arc<CookieJar>,
    notifier: Arc<ShardNotifier>,
}

impl VBucket {
    /// Creates a fresh vbucket in the given state.
    pub fn new(
        id: Vbid,
        state: VBucketState,
        config: Arc<Config>,
        stats: Arc<EngineStats>,
        jar: Arc<CookieJar>,
        notifier: Arc<ShardNotifier>,
    ) -> Arc<VBucket> {
        let ht = HashTable::new(
            config.ht_size,
            config.ht_locks,
            config.item_eviction_policy,
            Arc::clone(&stats),
        );
        let vb = VBucket {
            id,
            state: RwLock::new(state),
            ht,
            checkpoints: CheckpointManager::new(id, 0, config.chk_max_items, Arc::clone(&stats)),
            bloom: BloomFilter::new(
                config.bfilter_enabled,
                config.bfilter_key_count,
                config.bfilter_fp_prob,
            ),
            failover: RwLock::new(FailoverTable::new(0)),
            hlc: HybridLogicalClock::new(
                Cas::WILDCARD,
                config.hlc_drift_ahead_threshold_us,
                config.hlc_drift_behind_threshold_us,
            ),
            high_seqno: AtomicU64::new(0),
            purge_seqno: AtomicU64::new(0),
            last_persisted_seqno: AtomicU64::new(0),
            last_persisted_snap_start: AtomicU64::new(0),
            last_persisted_snap_end: AtomicU64::new(0),
            max_deleted_rev: AtomicU64::new(0),
            bgfetch_queue: Mutex::new(FxHashMap::default()),
            pending_ops: Mutex::new(Vec::new()),
            bucket_creation: AtomicBool::new(true),
            config,
            stats,
            jar,
            notifier,
        };
        info!(vb = id.0, state = %state, "vbucket.created");
        Arc::new(vb)
    }

    /// Rebuilds a vbucket from its persisted state record at warmup.
    pub fn from_warmup(
        id: Vbid,
        record: &VBucketStateRecord,
        config: Arc<Config>,
        stats: Arc<EngineStats>,
        jar: Arc<CookieJar>,
        notifier: Arc<ShardNotifier>,
    ) -> Arc<VBucket> {
        let vb = VBucket::new(id, record.state, config, stats, jar, notifier);
        vb.high_seqno.store(record.high_seqno, Ordering::Release);
        vb.last_persisted_seqno.store(record.high_seqno, Ordering::Release);
        vb.last_persisted_snap_start.store(record.snap_start, Ordering::Release);
        vb.last_persisted_snap_end.store(record.snap_end.max(record.high_seqno), Ordering::Release);
        vb.purge_seqno.store(record.purge_seqno, Ordering::Release);
        vb.max_deleted_rev.store(record.max_deleted_seqno, Ordering::Release);
        vb.hlc.set_max_cas(record.max_cas);
        {
            let mut failover = vb.failover.write();
            *failover = record.failover_table.clone();
            if failover.sanitize(record.high_seqno) {
                info!(vb = id.0, "vbucket.failover.synthesized");
            }
        }
        vb.bucket_creation.store(false, Ordering::Release);
        vb
    }

    /// Vbucket id.
    pub fn id(&self) -> Vbid {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    /// Highest assigned seqno.
    pub fn high_seqno(&self) -> Seqno {
        self.high_seqno.load(Ordering::Acquire)
    }

    /// Highest seqno removed by compaction.
    pub fn purge_seqno(&self) -> Seqno {
        self.purge_seqno.load(Ordering::Acquire)
    }

    /// Highest seqno confirmed on disk.
    pub fn last_persisted_seqno(&self) -> Seqno {
        self.last_persisted_seqno.load(Ordering::Acquire)
    }

    /// The hash table (for pagers, warmup, and tests).
    pub fn ht(&self) -> &HashTable {
        &self.ht
    }

    /// The checkpoint log.
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    /// The bloom filter.
    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Latest failover entry.
    pub fn failover_latest(&self) -> FailoverEntry {
        self.failover.read().latest()
    }

    /// Whether the on-disk file has not been created yet.
    pub fn is_bucket_creation(&self) -> bool {
        self.bucket_creation.load(Ordering::Acquire)
    }

    /// Marks the on-disk file as created (first successful flush).
    pub fn mark_file_created(&self) {
        self.bucket_creation.store(false, Ordering::Release);
    }

    fn next_seqno(&self) -> Seqno {
        self.high_seqno.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn register_pending_op(&self, cookie: Cookie) {
        self.pending_ops.lock().push(cookie);
    }

    fn check_ready(&self, cookie: Cookie) -> Option<Status> {
        match self.state() {
            VBucketState::Active => None,
            VBucketState::Pending => {
                self.register_pending_op(cookie);
                Some(Status::WouldBlock)
            }
            VBucketState::Replica | VBucketState::Dead => {
                self.stats.inc_vb_ops_reject();
                Some(Status::NotMyVbucket)
            }
        }
    }

    fn memory_status(&self) -> Option<Status> {
        if self.stats.mem_used() >= self.config.max_size {
            Some(Status::NoMemory)
        } else {
            None
        }
    }

    /// Steps 2-7 of the mutation pipeline: seqno, checkpoint append,
    /// bloom insert, flusher notification. The hash-bucket update (step 1)
    /// has already happened under `_guard`, which proves the lock is held.
    fn stamp_and_queue(&self, _guard: &BucketGuard<'_>, item: &Item) {
        self.checkpoints.queue_dirty(item.clone());
        self.bloom.add(&item.key);
        if item.deleted {
            self.max_deleted_rev.fetch_max(item.meta.rev_seqno, Ordering::AcqRel);
        }
        self.notifier.notify_flusher();
    }

    fn queue_bgfetch(&self, key: &DocKey, cookie: Cookie, meta_only: bool) {
        {
            let mut queue = self.bgfetch_queue.lock();
            let waiter = queue.entry(key.clone()).or_insert_with(|| BgFetchWaiter {
                cookies: Vec::new(),
                meta_only,
                queued_at: Instant::now(),
            });
            if !meta_only {
                waiter.meta_only = false;
            }
            waiter.cookies.push(cookie);
        }
        self.notifier.notify_bgfetcher();
    }

    /// Drains the background-fetch queue for the fetcher.
    pub fn take_bgfetch_jobs(&self) -> Vec<BgFetchJob> {
        let drained = std::mem::take(&mut *self.bgfetch_queue.lock());
        drained
            .into_iter()
            .map(|(key, w)| BgFetchJob {
                key,
                cookies: w.cookies,
                meta_only: w.meta_only,
                queued_at: w.queued_at,
            })
            .collect()
    }

    /// Outstanding background-fetch keys.
    pub fn has_pending_bgfetches(&self) -> bool {
        !self.bgfetch_queue.lock().is_empty()
    }

    /// Puts jobs back on the queue after a failed fetch round so the next
    /// pass retries them.
    pub fn requeue_bgfetch_jobs(&self, jobs: Vec<BgFetchJob>) {
        let mut queue = self.bgfetch_queue.lock();
        for job in jobs {
            let waiter = queue.entry(job.key).or_insert_with(|| BgFetchWaiter {
                cookies: Vec::new(),
                meta_only: job.meta_only,
                queued_at: job.queued_at,
            });
            if !job.meta_only {
                waiter.meta_only = false;
            }
            waiter.cookies.extend(job.cookies);
        }
    }

    fn expire_locked(&self, guard: &mut BucketGuard<'_>, depth: usize, source: ExpirySource) {
        let (key, rev) = {
            let sv = guard.sv(depth);
            (sv.key().clone(), sv.rev_seqno())
        };
        let mut tomb = Item::deleted(self.id, key);
        tomb.meta.rev_seqno = rev + 1;
        tomb.meta.cas = self.hlc.next_cas();
        tomb.by_seqno = self.next_seqno();
        guard.apply_item(depth, &tomb, true);
        self.ht.dec_num_total_items();
        self.stamp_and_queue(guard, &tomb);
        match source {
            ExpirySource::Access => {
                self.stats.inc_expired_access();
                self.stats.inc_vb_expired(self.state());
            }
            ExpirySource::Pager => {
                self.stats.inc_expired_pager();
                self.stats.inc_vb_expired(self.state());
            }
            ExpirySource::Compactor => self.stats.inc_expired_compactor(),
        }
        debug!(vb = self.id.0, ?source, "vbucket.expired");
    }

    /// Deletes the key if (and only if) it is currently expired. Used by
    /// the expiry pager after a lock-free scan found a stale entry.
    pub fn expire_if_needed(&self, key: &DocKey, source: ExpirySource) -> bool {
        let now_unix = unix_now();
        let mut guard = self.ht.lock_key(key);
        let Some(depth) = guard.depth_of(key, false) else {
            return false;
        };
        let sv = guard.sv(depth);
        if sv.is_temp() || !sv.is_expired_at(now_unix) {
            return false;
        }
        if sv.is_locked(Instant::now()) {
            return false;
        }
        self.expire_locked(&mut guard, depth, source);
        true
    }

    /// Reads a key.
    pub fn get(&self, key: &DocKey, cookie: Cookie) -> GetOutcome {
        if let Some(status) = self.check_ready(cookie) {
            return GetOutcome::fail(status);
        }
        let now_unix = unix_now();
        let mut guard = self.ht.lock_key(key);
        match guard.depth_of(key, true) {
            Some(depth) => {
                if let Some(temp) = guard.sv(depth).temp_state() {
                    return match temp {
                        TempState::Fetching => {
                            drop(guard);
                            self.queue_bgfetch(key, cookie, false);
                            GetOutcome::fail(Status::WouldBlock)
                        }
                        TempState::NonExistent => {
                            guard.release(depth);
                            GetOutcome::fail(Status::KeyNotFound)
                        }
                        TempState::Complete => {
                            if guard.sv(depth).is_deleted() {
                                guard.release(depth);
                                GetOutcome::fail(Status::KeyNotFound)
                            } else {
                                // Metadata only; the value still lives on disk.
                                drop(guard);
                                self.queue_bgfetch(key, cookie, false);
                                GetOutcome::fail(Status::WouldBlock)
                            }
                        }
                    };
                }
                if guard.sv(depth).is_deleted() {
                    return GetOutcome::fail(Status::KeyNotFound);
                }
                if guard.sv(depth).is_expired_at(now_unix) {
                    self.expire_locked(&mut guard, depth, ExpirySource::Access);
                    return GetOutcome::fail(Status::KeyNotFound);
                }
                if !guard.sv(depth).is_resident() {
                    drop(guard);
                    self.queue_bgfetch(key, cookie, false);
                    return GetOutcome::fail(Status::WouldBlock);
                }
                let sv = guard.sv_mut(depth);
                sv.set_referenced();
                GetOutcome {
                    status: Status::Success,
                    value: sv.value().cloned(),
                    cas: sv.visible_cas(Instant::now()),
                    flags: sv.flags(),
                    datatype: sv.datatype(),
                }
            }
            None => self.miss_to_bgfetch(guard, key, cookie, false),
        }
    }

    /// Shared miss path: under full eviction the key may still be on
    /// disk, so consult the bloom filter and fetch if it says probe.
    fn miss_to_bgfetch(
        &self,
        mut guard: BucketGuard<'_>,
        key: &DocKey,
        cookie: Cookie,
        meta_only: bool,
    ) -> GetOutcome {
        if self.config.item_eviction_policy == EvictionPolicy::ValueOnly {
            return GetOutcome::fail(Status::KeyNotFound);
        }
        if !self.bloom.maybe_contains(key) {
            self.stats.inc_bloom_filter_skips();
            return GetOutcome::fail(Status::KeyNotFound);
        }
        guard.insert(StoredValue::temp(key.clone()));
        drop(guard);
        self.queue_bgfetch(key, cookie, meta_only);
        GetOutcome::fail(Status::WouldBlock)
    }

    /// Stores a value (SET).
    pub fn set(&self, item: Item, cas: Cas, cookie: Cookie) -> MutationOutcome {
        self.store(item, cas, cookie, StoreMode::Set)
    }

    /// Stores only if absent (ADD). A tombstone in the table revives.
    pub fn add(&self, item: Item, cookie: Cookie) -> MutationOutcome {
        self.store(item, Cas::WILDCARD, cookie, StoreMode::Add)
    }

    /// Stores only over an existing live item (REPLACE).
    pub fn replace(&self, item: Item, cas: Cas, cookie: Cookie) -> MutationOutcome {
        self.store(item, cas, cookie, StoreMode::Replace)
    }

    fn store(&self, mut item: Item, cas: Cas, cookie: Cookie, mode: StoreMode) -> MutationOutcome {
        if let Some(status) = self.check_ready(cookie) {
            return MutationOutcome::fail(status);
        }
        if let Some(status) = self.memory_status() {
            return MutationOutcome::fail(status);
        }
        let now_unix = unix_now();
        let now = Instant::now();
        let key = item.key.clone();
        let mut guard = self.ht.lock_key(&key);
        let depth = guard.depth_of(&key, true);

        // Resolve temp records first: they carry (or await) disk metadata.
        if let Some(d) = depth {
            if let Some(temp) = guard.sv(d).temp_state() {
                match temp {
                    TempState::Fetching => {
                        drop(guard);
                        self.queue_bgfetch(&key, cookie, true);
                        return MutationOutcome::fail(Status::WouldBlock);
                    }
                    TempState::NonExistent => {
                        guard.release(d);
                        return self.store_fresh(guard, item, cas, mode);
                    }
                    TempState::Complete => {
                        // Fall through: the record now carries real
                        // metadata and the normal checks apply.
                    }
                }
            }
        }

        match depth {
            Some(d) => {
                let (deleted, locked, stored_cas, rev, expired) = {
                    let sv = guard.sv(d);
                    (
                        sv.is_deleted(),
                        sv.is_locked(now),
                        sv.cas(),
                        sv.rev_seqno(),
                        sv.is_expired_at(now_unix),
                    )
                };
                if deleted {
                    return match mode {
                        StoreMode::Replace => MutationOutcome::fail(Status::KeyNotFound),
                        StoreMode::Set if !cas.is_wildcard() => {
                            MutationOutcome::fail(Status::KeyNotFound)
                        }
                        // SET and ADD both revive tombstones.
                        _ => {
                            item.meta.rev_seqno = rev + 1;
                            self.commit_store(&mut guard, d, item, true)
                        }
                    };
                }
                if mode == StoreMode::Add && !expired {
                    return MutationOutcome::fail(Status::KeyExists);
                }
                if expired && (mode == StoreMode::Replace || !cas.is_wildcard()) {
                    // CAS and replace target a live revision; an expired
                    // one counts as absent.
                    self.expire_locked(&mut guard, d, ExpirySource::Access);
                    return MutationOutcome::fail(Status::KeyNotFound);
                }
                if locked {
                    if cas.is_wildcard() || cas != stored_cas {
                        return MutationOutcome::fail(Status::Locked);
                    }
                } else if !cas.is_wildcard() && cas != stored_cas {
                    return MutationOutcome::fail(Status::KeyExists);
                }
                item.meta.rev_seqno = rev + 1;
                self.commit_store(&mut guard, d, item, false)
            }
            None => match mode {
                StoreMode::Replace => {
                    let out = self.meta_probe_for_miss(guard, &key, cookie);
                    out.unwrap_or_else(|| MutationOutcome::fail(Status::KeyNotFound))
                }
                StoreMode::Set if !cas.is_wildcard() => {
                    let out = self.meta_probe_for_miss(guard, &key, cookie);
                    out.unwrap_or_else(|| MutationOutcome::fail(Status::KeyNotFound))
                }
                _ => self.store_fresh(guard, item, cas, mode),
            },
        }
    }

    /// A CAS-carrying or replace miss under full eviction cannot be judged
    /// from memory alone: probe disk metadata first. Returns `None` when
    /// the key is authoritatively absent.
    fn meta_probe_for_miss(
        &self,
        mut guard: BucketGuard<'_>,
        key: &DocKey,
        cookie: Cookie,
    ) -> Option<MutationOutcome> {
        if self.config.item_eviction_policy == EvictionPolicy::ValueOnly {
            return None;
        }
        if !self.bloom.maybe_contains(key) {
            self.stats.inc_bloom_filter_skips();
            return None;
        }
        guard.insert(StoredValue::temp(key.clone()));
        drop(guard);
        self.queue_bgfetch(key, cookie, true);
        Some(MutationOutcome::fail(Status::WouldBlock))
    }

    fn store_fresh(
        &self,
        mut guard: BucketGuard<'_>,
        mut item: Item,
        cas: Cas,
        mode: StoreMode,
    ) -> MutationOutcome {
        if mode == StoreMode::Replace || !cas.is_wildcard() {
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        item.meta.rev_seqno = self.max_deleted_rev.load(Ordering::Acquire) + 1;
        item.meta.cas = self.hlc.next_cas();
        item.by_seqno = self.next_seqno();
        guard.insert(StoredValue::from_item(&item, true));
        self.ht.inc_num_total_items();
        self.stamp_and_queue(&guard, &item);
        MutationOutcome::ok(item.meta.cas, item.by_seqno)
    }

    fn commit_store(
        &self,
        guard: &mut BucketGuard<'_>,
        depth: usize,
        mut item: Item,
        was_tombstone: bool,
    ) -> MutationOutcome {
        item.meta.cas = self.hlc.next_cas();
        item.by_seqno = self.next_seqno();
        guard.apply_item(depth, &item, true);
        if was_tombstone && !item.deleted {
            self.ht.inc_num_total_items();
        }
        if !was_tombstone && item.deleted {
            self.ht.dec_num_total_items();
        }
        self.stamp_and_queue(guard, &item);
        MutationOutcome::ok(item.meta.cas, item.by_seqno)
    }

    /// Deletes a key (DELETE).
    pub fn del(&self, key: &DocKey, cas: Cas, cookie: Cookie) -> MutationOutcome {
        if let Some(status) = self.check_ready(cookie) {
            return MutationOutcome::fail(status);
        }
        let now = Instant::now();
        let now_unix = unix_now();
        let mut guard = self.ht.lock_key(key);
        let Some(depth) = guard.depth_of(key, true) else {
            let probed = self.meta_probe_for_miss(guard, key, cookie);
            return probed.unwrap_or_else(|| MutationOutcome::fail(Status::KeyNotFound));
        };
        if let Some(temp) = guard.sv(depth).temp_state() {
            return match temp {
                TempState::Fetching => {
                    drop(guard);
                    self.queue_bgfetch(key, cookie, true);
                    MutationOutcome::fail(Status::WouldBlock)
                }
                TempState::NonExistent => {
                    guard.release(depth);
                    MutationOutcome::fail(Status::KeyNotFound)
                }
                TempState::Complete => {
                    if guard.sv(depth).is_deleted() {
                        guard.release(depth);
                        MutationOutcome::fail(Status::KeyNotFound)
                    } else {
                        self.delete_at(&mut guard, depth, cas)
                    }
                }
            };
        }
        if guard.sv(depth).is_deleted() {
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        if guard.sv(depth).is_expired_at(now_unix) {
            self.expire_locked(&mut guard, depth, ExpirySource::Access);
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        if guard.sv(depth).is_locked(now) {
            let stored_cas = guard.sv(depth).cas();
            if cas.is_wildcard() || cas != stored_cas {
                return MutationOutcome::fail(Status::Locked);
            }
        }
        self.delete_at(&mut guard, depth, cas)
    }

    fn delete_at(&self, guard: &mut BucketGuard<'_>, depth: usize, cas: Cas) -> MutationOutcome {
        let (stored_cas, rev, flags) = {
            let sv = guard.sv(depth);
            (sv.cas(), sv.rev_seqno(), sv.flags())
        };
        if !cas.is_wildcard() && cas != stored_cas {
            return MutationOutcome::fail(Status::KeyExists);
        }
        let mut tomb = Item::deleted(self.id, guard.sv(depth).key().clone());
        tomb.meta.rev_seqno = rev + 1;
        tomb.meta.flags = flags;
        self.commit_store(guard, depth, tomb, false)
    }

    /// Reads and refreshes the expiry (GAT).
    pub fn get_and_touch(&self, key: &DocKey, new_exptime: u32, cookie: Cookie) -> GetOutcome {
        let got = self.get(key, cookie);
        if got.status != Status::Success {
            return got;
        }
        let touched = self.touch(key, new_exptime, cookie);
        if touched.status != Status::Success {
            return GetOutcome::fail(touched.status);
        }
        GetOutcome { cas: touched.cas, ..got }
    }

    /// Refreshes the expiry without reading (TOUCH).
    pub fn touch(&self, key: &DocKey, new_exptime: u32, cookie: Cookie) -> MutationOutcome {
        if let Some(status) = self.check_ready(cookie) {
            return MutationOutcome::fail(status);
        }
        let now = Instant::now();
        let now_unix = unix_now();
        let mut guard = self.ht.lock_key(key);
        let Some(depth) = guard.depth_of(key, false) else {
            return MutationOutcome::fail(Status::KeyNotFound);
        };
        if guard.sv(depth).is_temp() {
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        if guard.sv(depth).is_expired_at(now_unix) {
            self.expire_locked(&mut guard, depth, ExpirySource::Access);
            return MutationOutcome::fail(Status::KeyNotFound);
        }
        if guard.sv(depth).is_locked(now) {
            return MutationOutcome::fail(Status::Locked);
        }
        if !guard.sv(depth).is_resident() {
            drop(guard);
            self.queue_bgfetch(key, cookie, false);
            return MutationOutcome::fail(Status::WouldBlock);
        }
        let sv = guard.sv(depth);
        let mut item = sv.to_item(self.id);
        item.meta.exptime = new_exptime;
        item.meta.rev_seqno = sv.rev_seqno() + 1;
        self.commit_store(&mut guard, depth, item, false)
    }

    /// Locks a key for exclusive mutation (GETL).
    pub fn get_locked(&self, key: &DocKey, lock_timeout: Duration, cookie: Cookie) -> GetOutcome {
        if let Some(status) = self.check_ready(cookie) {
            return GetOutcome::fail(status);
        }
        let timeout = if lock_timeout.is_zero() {
            self.config.getl_default_timeout
        } else {
            lock_timeout.min(self.config.getl_max_timeout)
        };
        let now = Instant::now();
        let now_unix = unix_now();
        let mut guard = self.ht.lock_key(key);
        let Some(depth) = guard.depth_of(key, false) else {
            let miss = self.miss_to_bgfetch(guard, key, cookie, false);
            return miss;
        };
        if guard.sv(depth).is_temp() {
            drop(guard);
            self.queue_bgfetch(key, cookie, false);
            return GetOutcome::fail(Status::WouldBlock);
        }
        if guard.sv(depth).is_expired_at(now_unix) {
            self.expire_locked(&mut guard, depth, ExpirySource::Access);
            return GetOutcome::fail(Status::KeyNotFound);
        }
        if guard.sv(depth).is_locked(now) {
            return GetOutcome::fail(Status::Locked);
        }
        if !guard.sv(depth).is_resident() {
            drop(guard);
            self.queue_bgfetch(key, cookie, false);
            return GetOutcome::fail(Status::WouldBlock);
        }
        let sv = guard.sv_mut(depth);
        sv.lock_until(now + timeout);
        sv.set_referenced();
        GetOutcome {
            status: Status::Success,
            value: sv.value().cloned(),
            cas: sv.cas(),
            flags: sv.flags(),
            datatype: sv.datatype(),
        }
    }

    /// Releases a GETL lock (UNLOCK).
    pub fn unlock(&self, key: &DocKey, cas: Cas, cookie: Cookie) -> Status {
        if let Some(status) = self.check_ready(cookie) {
            return status;
        }
        let now = Instant::now();
        let mut guard = self.ht.lock_key(key);
        let Some(depth) = guard.depth_of(key, false) else {
            return Status::KeyNotFound;
        };
        let sv = guard.sv_mut(depth);
        if !sv.is_locked(now) {
            return Status::TempFailure;
        }
        if cas != sv.cas() {
            return Status::Locked;
        }
        sv.unlock();
        Status::Success
    }

    /// Reads revision metadata (GET_META), fetching from disk when only
    /// the disk knows the key.
    pub fn get_meta(&self, key: &DocKey, cookie: Cookie) -> MetaOutcome {
        if let Some(status) = self.check_ready(cookie) {
            return MetaOutcome::fail(status);
        }
        let now_unix = unix_now();
        let mut guard = self.ht.lock_key(key);
        match guard.depth_of(key, true) {
            Some(depth) => {
                if let Some(temp) = guard.sv(depth).temp_state() {
                    return match temp {
                        TempState::Fetching => {
                            drop(guard);
                            self.queue_bgfetch(key, cookie, true);
                            MetaOutcome::fail(Status::WouldBlock)
                        }
                        TempState::NonExistent => {
                            guard.release(depth);
                            MetaOutcome::fail(Status::KeyNotFound)
                        }
                        TempState::Complete => {
                            let sv = guard.sv(depth);
                            let out = MetaOutcome {
                                status: Status::Success,
                                meta: sv.meta(),
                                deleted: sv.is_deleted(),
                            };
                            guard.release(depth);
                            out
                        }
                    };
                }
                if guard.sv(depth).is_expired_at(now_unix) {
                    self.expire_locked(&mut guard, depth, ExpirySource::Access);
                }
                let sv = guard.sv(depth);
                MetaOutcome { status: Status::Success, meta: sv.meta(), deleted: sv.is_deleted() }
            }
            None => {
                // Even under value eviction a tombstone's metadata may
                // exist only on disk (persisted tombstones leave the
                // table), so a miss always probes, bloom permitting.
                if !self.bloom.maybe_contains(key) {
                    self.stats.inc_bloom_filter_skips();
                    return MetaOutcome::fail(Status::KeyNotFound);
                }
                guard.insert(StoredValue::temp(key.clone()));
                drop(guard);
                self.queue_bgfetch(key, cookie, true);
                MetaOutcome::fail(Status::WouldBlock)
            }
        }
    }

    /// Applies a replicated or restored mutation with caller-supplied
    /// metadata (SET_WITH_META).
    pub fn set_with_meta(
        &self,
        mut item: Item,
        cas: Cas,
        cookie: Cookie,
        force: bool,
    ) -> MutationOutcome {
        if let Some(status) = self.check_ready(cookie) {
            return MutationOutcome::fail(status);
        }
        if let Some(status) = self.memory_status() {
            return MutationOutcome::fail(status);
        }
        let now = Instant::now();
        let key = item.key.clone();
        let mut guard = self.ht.lock_key(&key);
        match guard.depth_of(&key, true) {
            Some(depth) => {
                if let Some(temp) = guard.sv(depth).temp_state() {
                    match temp {
                        TempState::Fetching => {
                            drop(guard);
                            self.queue_bgfetch(&key, cookie, true);
                            return MutationOutcome::fail(Status::WouldBlock);
                        }
                        TempState::NonExistent => {
                            guard.release(depth);
                            return self.with_meta_fresh(guard, item);
                        }
                        TempState::Complete => {}
                    }
                }
                let (stored_meta, deleted, locked, stored_cas) = {
                    let sv = guard.sv(depth);
                    (sv.meta(), sv.is_deleted(), sv.is_locked(now), sv.cas())
                };
                if locked && !force {
                    return MutationOutcome::fail(Status::Locked);
                }
                if !cas.is_wildcard() && cas != stored_cas {
                    return MutationOutcome::fail(Status::KeyExists);
                }
                if !force && !item.meta.wins_over(&stored_meta) {
                    // Local copy wins: accepted but skipped.
                    return MutationOutcome::fail(Status::KeyExists);
                }
                self.hlc.observe_cas(item.meta.cas, &self.stats);
                item.by_seqno = self.next_seqno();
                guard.apply_item(depth, &item, true);
                if deleted && !item.deleted {
                    self.ht.inc_num_total_items();
                }
                if !deleted && item.deleted {
                    self.ht.dec_num_total_items();
                }
                self.stamp_and_queue(&guard, &item);
                MutationOutcome::ok(item.meta.cas, item.by_seqno)
            }
            None => {
                if self.config.item_eviction_policy == EvictionPolicy::FullEviction
                    && self.bloom.maybe_contains(&key)
                    && !force
                {
                    guard.insert(StoredValue::temp(key.clone()));
                    drop(guard);
                    self.queue_bgfetch(&key, cookie, true);
                    return MutationOutcome::fail(Status::WouldBlock);
                }
                self.with_meta_fresh(guard, item)
            }
        }
    }

    fn with_meta_fresh(&self, mut guard: BucketGuard<'_>, mut item: Item) -> MutationOutcome {
        self.hlc.observe_cas(item.meta.cas, &self.stats);
        item.by_seqno = self.next_seqno();
        guard.insert(StoredValue::from_item(&item, true));
        if !item.deleted {
            self.ht.inc_num_total_items();
        }
        self.stamp_and_queue(&guard, &item);
        MutationOutcome::ok(item.meta.cas, item.by_seqno)
    }

    /// Applies a replicated deletion with caller-supplied metadata
    /// (DEL_WITH_META).
    pub fn del_with_meta(
        &self,
        key: &DocKey,
        meta: ItemMeta,
        cas: Cas,
        cookie: Cookie,
        force: bool,
    ) -> MutationOutcome {
        let mut tomb = Item::deleted(self.id, key.clone());
        tomb.meta = meta;
        self.set_with_meta(tomb, cas, cookie, force)
    }

    /// Explicitly evicts a key's value (EVICT_KEY).
    pub fn evict_key(&self, key: &DocKey) -> Status {
        let mut guard = self.ht.lock_key(key);
        let Some(depth) = guard.depth_of(key, false) else {
            return Status::KeyNotFound;
        };
        if guard.sv(depth).is_temp() {
            return Status::KeyNotFound;
        }
        match guard.eject(depth) {
            EjectOutcome::ValueEjected | EjectOutcome::Unlinked => Status::Success,
            EjectOutcome::NotEjected => Status::TempFailure,
            EjectOutcome::NotFound => Status::KeyNotFound,
        }
    }

    /// Per-key persistence observation (OBSERVE).
    pub fn observe(&self, key: &DocKey) -> (ObserveKeyState, Cas) {
        let guard = self.ht.lock_key(key);
        match guard.depth_of(key, true) {
            Some(depth) => {
                let sv = guard.sv(depth);
                if sv.is_temp() {
                    return (ObserveKeyState::NotFound, Cas::WILDCARD);
                }
                if sv.is_deleted() {
                    return (ObserveKeyState::LogicallyDeleted, sv.cas());
                }
                if sv.is_dirty() {
                    (ObserveKeyState::NotPersisted, sv.cas())
                } else {
                    (ObserveKeyState::Persisted, sv.cas())
                }
            }
            None => (ObserveKeyState::NotFound, Cas::WILDCARD),
        }
    }

    /// Seqno observation with failover detection (OBSERVE_SEQNO).
    pub fn observe_seqno(&self, vb_uuid: u64) -> ObserveSeqnoOutcome {
        let failover = self.failover.read();
        let latest = failover.latest();
        let failed_over = latest.vb_uuid != vb_uuid;
        let rollback = if failed_over { failover.rollback_point(vb_uuid) } else { None };
        ObserveSeqnoOutcome {
            failed_over,
            vb_uuid: latest.vb_uuid,
            last_persisted_seqno: self.last_persisted_seqno(),
            current_seqno: self.high_seqno(),
            old_vb_uuid: rollback.map(|(uuid, _)| uuid),
            old_seqno: rollback.map(|(_, seqno)| seqno),
        }
    }

    /// Extends the failover table after a restart so clients holding the
    /// pre-restart uuid are forced through rollback detection.
    pub fn extend_failover_for_restart(&self) {
        let high = self.high_seqno();
        let entry = self.failover.write().create_entry(high);
        debug!(
            vb = self.id.0,
            uuid = %hex::encode(entry.vb_uuid.to_be_bytes()),
            "vbucket.failover.extended"
        );
    }

    /// Changes the vbucket state. Returns false for an illegal transition.
    pub fn set_state(&self, new_state: VBucketState) -> bool {
        let mut state = self.state.write();
        if !state.can_transition_to(new_state) {
            warn!(vb = self.id.0, from = %*state, to = %new_state, "vbucket.state.illegal");
            return false;
        }
        let old = *state;
        *state = new_state;
        drop(state);
        info!(vb = self.id.0, from = %old, to = %new_state, "vbucket.state_change");
        if new_state == VBucketState::Active && old != VBucketState::Active {
            self.failover.write().create_entry(self.high_seqno());
            self.checkpoints.create_new_checkpoint();
        }
        match new_state {
            VBucketState::Active => self.resolve_pending_ops(Status::Success),
            VBucketState::Dead => {
                self.resolve_pending_ops(Status::NotMyVbucket);
                self.fail_bgfetches(Status::NotMyVbucket);
            }
            _ => {}
        }
        true
    }

    fn resolve_pending_ops(&self, status: Status) {
        let cookies = std::mem::take(&mut *self.pending_ops.lock());
        for cookie in cookies {
            self.jar.notify(cookie, status);
        }
    }

    fn fail_bgfetches(&self, status: Status) {
        for job in self.take_bgfetch_jobs() {
            for cookie in job.cookies {
                self.jar.notify(cookie, status);
            }
        }
    }

    /// Tears down in-memory state when the vbucket is deleted: every
    /// waiter learns the vbucket is gone exactly once.
    pub fn tear_down(&self) {
        self.set_state(VBucketState::Dead);
        self.ht.clear();
    }

    /// Completes one background fetch, restoring into the table and
    /// collecting the cookies to notify (with their status).
    pub fn complete_bg_fetch(&self, key: &DocKey, fetched: Option<Item>, meta_only: bool) -> Status {
        let mut guard = self.ht.lock_key(key);
        let status = match guard.depth_of(key, true) {
            Some(depth) => {
                let is_temp = guard.sv(depth).is_temp();
                match (&fetched, is_temp, meta_only) {
                    (Some(item), true, true) => {
                        guard.restore_meta(depth, item);
                        self.stats.inc_bg_meta_fetched();
                        Status::Success
                    }
                    (Some(item), true, false) => {
                        if item.deleted {
                            guard.restore_meta(depth, item);
                        } else {
                            guard.restore_meta(depth, item);
                            guard.restore_value(depth, item);
                        }
                        self.stats.inc_bg_fetched();
                        Status::Success
                    }
                    (Some(item), false, _) => {
                        if !guard.sv(depth).is_resident() {
                            guard.restore_value(depth, item);
                        }
                        self.stats.inc_bg_fetched();
                        Status::Success
                    }
                    (None, true, _) => {
                        guard.sv_mut(depth).set_temp_non_existent();
                        if meta_only {
                            self.stats.inc_bg_meta_fetched();
                        } else {
                            self.stats.inc_bg_fetched();
                        }
                        Status::Success
                    }
                    (None, false, _) => {
                        warn!(vb = self.id.0, %key, "vbucket.bgfetch.value_missing");
                        Status::TempFailure
                    }
                }
            }
            // The record went away (deleted meanwhile); the retry will
            // observe current state.
            None => Status::Success,
        };
        drop(guard);
        status
    }

    /// Clears the dirty flag (or removes a persisted tombstone) after the
    /// flusher committed `item`.
    pub fn complete_flush(&self, item: &Item) {
        let mut guard = self.ht.lock_key(&item.key);
        let Some(depth) = guard.depth_of(&item.key, true) else {
            return;
        };
        let sv = guard.sv(depth);
        if sv.is_temp() || sv.by_seqno() != item.by_seqno {
            return;
        }
        if item.deleted {
            guard.release(depth);
        } else {
            guard.sv_mut(depth).mark_clean();
        }
    }

    /// Advances persistence watermarks after a commit.
    pub fn post_commit(&self, snap_start: Seqno, snap_end: Seqno) {
        self.last_persisted_seqno.fetch_max(snap_end, Ordering::AcqRel);
        self.last_persisted_snap_start.store(snap_start, Ordering::Release);
        self.last_persisted_snap_end.fetch_max(snap_end, Ordering::AcqRel);
    }

    /// Builds the state record persisted with every flush batch.
    pub fn state_record(&self) -> VBucketStateRecord {
        VBucketStateRecord {
            state: self.state(),
            checkpoint_id: self.checkpoints.open_checkpoint_id(),
            max_deleted_seqno: self.max_deleted_rev.load(Ordering::Acquire),
            failover_table: self.failover.read().clone(),
            snap_start: self.last_persisted_snap_start.load(Ordering::Acquire),
            snap_end: self.last_persisted_snap_end.load(Ordering::Acquire),
            max_cas: self.hlc.max_cas(),
            high_seqno: self.high_seqno(),
            purge_seqno: self.purge_seqno(),
            hlc_drift_thresholds: crate::kvstore::DriftThresholds {
                ahead_us: self.config.hlc_drift_ahead_threshold_us,
                behind_us: self.config.hlc_drift_behind_threshold_us,
            },
        }
    }

    /// Runs compaction against the vbucket's file, expiring items found
    /// stale and rebuilding the bloom filter from surviving keys.
    pub fn compact(
        &self,
        store: &dyn KvStore,
        purge_before_seqno: Seqno,
        drop_deletes: bool,
    ) -> Result<CompactionSummary> {
        struct Hooks<'a> {
            bloom: &'a BloomFilter,
            drop_deletes: bool,
            expired: Vec<Item>,
        }
        impl CompactionHooks for Hooks<'_> {
            fn expired(&mut self, item: Item) {
                self.expired.push(item);
            }
            fn bloom_key(&mut self, key: &DocKey, deleted: bool) {
                if !deleted || !self.drop_deletes {
                    self.bloom.rebuild_add(key);
                }
            }
        }

        let estimated = store.get_item_count(self.id)? as usize;
        self.bloom.begin_rebuild(estimated);
        let cfg = CompactionConfig { purge_before_seqno, drop_deletes };
        let mut hooks = Hooks { bloom: &self.bloom, drop_deletes, expired: Vec::new() };
        let summary = match store.compact_db(self.id, &cfg, &mut hooks) {
            Ok(summary) => summary,
            Err(err) => {
                self.bloom.abort_rebuild();
                return Err(err);
            }
        };
        self.bloom.complete_rebuild();
        if summary.purged_up_to > 0 {
            self.purge_seqno.fetch_max(summary.purged_up_to, Ordering::AcqRel);
        }
        for item in hooks.expired {
            self.expire_from_compaction(&item);
        }
        info!(
            vb = self.id.0,
            purged_up_to = summary.purged_up_to,
            tombstones = summary.tombstones_purged,
            "vbucket.compacted"
        );
        Ok(summary)
    }

    fn expire_from_compaction(&self, item: &Item) {
        let now_unix = unix_now();
        let mut guard = self.ht.lock_key(&item.key);
        match guard.depth_of(&item.key, false) {
            Some(depth) => {
                let sv = guard.sv(depth);
                if !sv.is_temp()
                    && sv.by_seqno() == item.by_seqno
                    && sv.is_expired_at(now_unix)
                {
                    self.expire_locked(&mut guard, depth, ExpirySource::Compactor);
                }
            }
            None => {
                // Full eviction: the expired revision lives only on disk.
                if self.config.item_eviction_policy == EvictionPolicy::FullEviction
                    && item.is_expired_at(now_unix)
                {
                    let mut tomb = Item::deleted(self.id, item.key.clone());
                    tomb.meta.rev_seqno = item.meta.rev_seqno + 1;
                    tomb.meta.cas = self.hlc.next_cas();
                    tomb.by_seqno = self.next_seqno();
                    guard.insert(StoredValue::from_item(&tomb, true));
                    self.ht.dec_num_total_items();
                    self.stamp_and_queue(&guard, &tomb);
                    self.stats.inc_expired_compactor();
                }
            }
        }
    }

    /// Any live key, for GET_RANDOM_KEY.
    pub fn random_key(&self, seed: u64) -> Option<DocKey> {
        self.ht.random_key(seed)
    }

    /// Resident ratio in percent (100 when the table is empty).
    pub fn resident_ratio(&self) -> u8 {
        let total = self.ht.num_total_items().max(self.ht.num_items());
        if total == 0 {
            return 100;
        }
        let live_in_mem = self
            .ht
            .num_items()
            .saturating_sub(self.ht.num_deleted_items())
            .saturating_sub(self.ht.num_non_resident());
        ((live_in_mem * 100) / total).min(100) as u8
    }
}

/// OBSERVE_SEQNO response payload.
#[derive(Clone, Copy, Debug)]
pub struct ObserveSeqnoOutcome {
    /// Whether the client's uuid no longer names the live lineage.
    pub failed_over: bool,
    /// Current lineage uuid.
    pub vb_uuid: u64,
    /// Highest seqno confirmed on disk.
    pub last_persisted_seqno: Seqno,
    /// Highest assigned seqno.
    pub current_seqno: Seqno,
    /// The client's old uuid, when it is known to this lineage.
    pub old_vb_uuid: Option<u64>,
    /// Seqno recorded for the old uuid.
    pub old_seqno: Option<Seqno>,
}

impl ObserveSeqnoOutcome {
    /// Encodes the wire layout: `format(1), vb(2), vb_uuid(8),
    /// last_persisted(8), current(8)[, old_uuid(8), old_seqno(8)]`.
    pub fn encode(&self, vb: Vbid) -> Vec<u8> {
        let mut out = Vec::with_capacity(43);
        out.push(self.failed_over as u8);
        out.extend_from_slice(&vb.0.to_be_bytes());
        out.extend_from_slice(&self.vb_uuid.to_be_bytes());
        out.extend_from_slice(&self.last_persisted_seqno.to_be_bytes());
        out.extend_from_slice(&self.current_seqno.to_be_bytes());
        if self.failed_over {
            out.extend_from_slice(&self.old_vb_uuid.unwrap_or(0).to_be_bytes());
            out.extend_from_slice(&self.old_seqno.unwrap_or(0).to_be_bytes());
        }
        out
    }
}

/// The bucket's array of vbucket slots, shared by shards and tasks.
pub struct VBucketMap {
    slots: Vec<RwLock<Option<Arc<VBucket>>>>,
}

impl VBucketMap {
    /// Creates an empty map with `n` slots.
    pub fn new(n: u16) -> VBucketMap {
        VBucketMap { slots: (0..n).map(|_| RwLock::new(None)).collect() }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no vbucket slot exists at all.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The vbucket in slot `vb`, if any.
    pub fn get(&self, vb: Vbid) -> Option<Arc<VBucket>> {
        self.slots.get(vb.0 as usize)?.read().clone()
    }

    /// Installs a vbucket.
    pub fn set(&self, vb: Arc<VBucket>) {
        if let Some(slot) = self.slots.get(vb.id().0 as usize) {
            *slot.write() = Some(vb);
        }
    }

    /// Frees a slot, returning what it held.
    pub fn remove(&self, vb: Vbid) -> Option<Arc<VBucket>> {
        self.slots.get(vb.0 as usize)?.write().take()
    }

    /// Every live vbucket.
    pub fn iter_live(&self) -> Vec<Arc<VBucket>> {
        self.slots.iter().filter_map(|s| s.read().clone()).collect()
    }

    /// Live vbuckets owned by shard `shard` of `num_shards`.
    pub fn iter_shard(&self, shard: usize, num_shards: usize) -> Vec<Arc<VBucket>> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(i, _)| i % num_shards == shard)
            .filter_map(|(_, s)| s.read().clone())
            .collect()
    }
}
