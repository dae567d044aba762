//! The bucket: engine facade over shards, vbuckets, and background tasks.
//!
//! Owns the vbucket map, the executor pool, and the traffic gate. Client
//! operations resolve their vbucket here, pass the bucket-level checks
//! (traffic enabled, memory pressure), and delegate to the vbucket.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, warn};

use crate::access_scanner::AccessScanner;
use crate::config::Config;
use crate::cookie::{CookieJar, CookieSink};
use crate::defragmenter::Defragmenter;
use crate::expiry_pager::{delay_until_hour, ExpiryPager};
use crate::executor::{ExecutorPool, TaskId, TaskOptions, TaskType};
use crate::item::{Item, ItemMeta};
use crate::item_pager::ItemPager;
use crate::kvstore::{file::FileKvStore, CompactionSummary, KvStore, ScanContinue, ValueFilter};
use crate::resizer::HashtableResizer;
use crate::shard::Shard;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::types::{Cas, Cookie, DocKey, EvictionPolicy, Seqno, Status, VBucketState, Vbid};
use crate::vbucket::{
    GetOutcome, MetaOutcome, MutationOutcome, ObserveKeyState, ObserveSeqnoOutcome, VBucket,
    VBucketMap,
};
use crate::warmup::{Warmup, WarmupState};

/// OBSERVE response entry for one key.
#[derive(Clone, Debug)]
pub struct ObserveResult {
    /// The observed key.
    pub key: DocKey,
    /// Persistence state of its newest revision.
    pub state: ObserveKeyState,
    /// CAS of that revision (wildcard when absent).
    pub cas: Cas,
}

/// Encodes OBSERVE results in the wire layout: `vb(2), keylen(2), key,
/// state(1), cas(8)` per key.
pub fn encode_observe(vb: Vbid, results: &[ObserveResult]) -> Vec<u8> {
    let mut out = Vec::new();
    for r in results {
        out.extend_from_slice(&vb.0.to_be_bytes());
        out.extend_from_slice(&(r.key.len() as u16).to_be_bytes());
        out.extend_from_slice(r.key.as_bytes());
        out.push(r.state.as_u8());
        out.extend_from_slice(&r.cas.0.to_be_bytes());
    }
    out
}

/// A bucket and its machinery. Created with [`Bucket::open`], torn down
/// with [`Bucket::shutdown`].
pub struct Bucket {
    config: Arc<Config>,
    stats: Arc<EngineStats>,
    jar: Arc<CookieJar>,
    pool: Arc<ExecutorPool>,
    vbmap: Arc<VBucketMap>,
    shards: Vec<Arc<Shard>>,
    flusher_tasks: Vec<TaskId>,
    item_pager_task: TaskId,
    traffic: Arc<AtomicBool>,
    warmup: Option<Arc<Warmup>>,
    cluster_config: Mutex<Bytes>,
    shut_down: AtomicBool,
}

impl Bucket {
    /// Opens the bucket: builds shards over the data directory, spawns
    /// the executor pool and background tasks, and kicks off warmup when
    /// persisted vbucket files exist.
    pub fn open(config: Config, sink: Box<dyn CookieSink>) -> crate::error::Result<Arc<Bucket>> {
        let config = Arc::new(config);
        let stats = Arc::new(EngineStats::default());
        let jar = Arc::new(CookieJar::new(sink));
        let vbmap = Arc::new(VBucketMap::new(config.max_vbuckets));
        let pool = ExecutorPool::new(
            config.max_num_writers,
            config.max_num_readers,
            config.max_num_auxio,
            config.max_num_nonio,
        );

        let mut shards = Vec::with_capacity(config.max_num_shards);
        let mut any_persisted = false;
        for shard_id in 0..config.max_num_shards {
            let store: Arc<dyn KvStore> = Arc::new(FileKvStore::open(config.data_dir.clone())?);
            if shard_id == 0 {
                any_persisted = !store.list_persisted_vbuckets()?.is_empty();
            }
            shards.push(Shard::new(
                shard_id,
                store,
                Arc::clone(&vbmap),
                Arc::clone(&config),
                Arc::clone(&stats),
                Arc::clone(&jar),
            ));
        }

        let mut flusher_tasks = Vec::with_capacity(shards.len());
        for shard in &shards {
            let (flusher_id, _) = shard.schedule_tasks(&pool);
            flusher_tasks.push(flusher_id);
        }

        let warming_up = config.warmup_enabled && any_persisted;
        let traffic = Arc::new(AtomicBool::new(!warming_up));
        let warmup = if warming_up {
            let stores: Vec<Arc<dyn KvStore>> =
                shards.iter().map(|s| Arc::clone(s.store())).collect();
            let notifiers = shards.iter().map(|s| Arc::clone(s.notifier())).collect();
            let warmup = Warmup::new(
                Arc::clone(&config),
                Arc::clone(&stats),
                Arc::clone(&jar),
                Arc::clone(&vbmap),
                stores,
                notifiers,
                Arc::clone(&traffic),
            );
            pool.schedule(
                warmup.task(),
                TaskType::Reader,
                TaskOptions { priority: 0, ..Default::default() },
            );
            Some(warmup)
        } else {
            None
        };

        let item_pager = ItemPager::new(Arc::clone(&vbmap), Arc::clone(&config), Arc::clone(&stats));
        let item_pager_task = pool.schedule(
            item_pager.task(),
            TaskType::NonIo,
            TaskOptions {
                initial_delay: config.pager_sleep_time,
                allow_dead_rearm: true,
                ..Default::default()
            },
        );

        if config.exp_pager_enabled {
            let pager = ExpiryPager::new(Arc::clone(&vbmap), Arc::clone(&config), Arc::clone(&stats));
            let initial = config
                .exp_pager_initial_run_time
                .map(delay_until_hour)
                .unwrap_or(config.exp_pager_stime);
            pool.schedule(
                pager.task(),
                TaskType::AuxIo,
                TaskOptions { initial_delay: initial, ..Default::default() },
            );
        }

        if config.defragmenter_enabled {
            let defrag =
                Defragmenter::new(Arc::clone(&vbmap), Arc::clone(&config), Arc::clone(&stats));
            pool.schedule(
                defrag.task(),
                TaskType::NonIo,
                TaskOptions { initial_delay: config.defragmenter_interval, ..Default::default() },
            );
        }

        let resizer = HashtableResizer::new(Arc::clone(&vbmap), Arc::clone(&config));
        pool.schedule(
            resizer.task(),
            TaskType::NonIo,
            TaskOptions { initial_delay: config.ht_resizer_interval, ..Default::default() },
        );

        let scanner = AccessScanner::new(Arc::clone(&vbmap), Arc::clone(&config), Arc::clone(&stats));
        let scanner_delay = config
            .alog_task_time
            .map(delay_until_hour)
            .unwrap_or(config.alog_sleep_time);
        pool.schedule(
            scanner.task(),
            TaskType::AuxIo,
            TaskOptions { initial_delay: scanner_delay, ..Default::default() },
        );

        info!(
            vbuckets = config.max_vbuckets,
            shards = config.max_num_shards,
            warming_up,
            "bucket.opened"
        );
        Ok(Arc::new(Bucket {
            config,
            stats,
            jar,
            pool,
            vbmap,
            shards,
            flusher_tasks,
            item_pager_task,
            traffic,
            warmup,
            cluster_config: Mutex::new(Bytes::new()),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// The bucket's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The live stats handle (for polling helpers).
    pub fn stats_handle(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// The engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The cookie jar, for frontends that stash retry state.
    pub fn cookie_jar(&self) -> &Arc<CookieJar> {
        &self.jar
    }

    /// Current warmup state, when a warmup is (or was) running.
    pub fn warmup_state(&self) -> Option<WarmupState> {
        self.warmup.as_ref().map(|w| w.state())
    }

    /// Whether client writes are currently refused.
    pub fn is_degraded(&self) -> bool {
        !self.traffic.load(Ordering::Acquire)
    }

    /// Allows client writes (ENABLE_TRAFFIC).
    pub fn enable_traffic(&self) {
        self.traffic.store(true, Ordering::Release);
        info!("bucket.traffic_enabled");
    }

    /// Refuses client writes (DISABLE_TRAFFIC).
    pub fn disable_traffic(&self) {
        self.traffic.store(false, Ordering::Release);
        info!("bucket.traffic_disabled");
    }

    /// Stores the opaque cluster configuration blob
    /// (SET_CLUSTER_CONFIG).
    pub fn set_cluster_config(&self, blob: Bytes) {
        *self.cluster_config.lock() = blob;
    }

    /// The stored cluster configuration blob (GET_CLUSTER_CONFIG).
    pub fn get_cluster_config(&self) -> Bytes {
        self.cluster_config.lock().clone()
    }

    /// The vbucket in a slot, for tests and tooling.
    pub fn vbucket(&self, vb: Vbid) -> Option<Arc<VBucket>> {
        self.vbmap.get(vb)
    }

    fn resolve(&self, vb: Vbid) -> Result<Arc<VBucket>, Status> {
        self.vbmap.get(vb).ok_or(Status::NotMyVbucket)
    }

    fn write_gate(&self) -> Option<Status> {
        if self.is_degraded() {
            self.stats.inc_vb_ops_reject();
            return Some(Status::TempFailure);
        }
        None
    }

    fn after_mutation(&self) {
        if self.stats.mem_used() > self.config.mem_high_wat {
            self.pool.wake(self.item_pager_task);
        }
    }

    /// GET.
    pub fn get(&self, vb: Vbid, key: &DocKey, cookie: Cookie) -> GetOutcome {
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.get(key, cookie),
            Err(status) => GetOutcome::fail(status),
        }
    }

    /// SET (or CAS when `cas` is non-zero).
    pub fn set(&self, item: Item, cas: Cas, cookie: Cookie) -> MutationOutcome {
        if let Some(status) = self.write_gate() {
            return MutationOutcome::fail(status);
        }
        let out = match self.resolve(item.vbid) {
            Ok(vbucket) => vbucket.set(item, cas, cookie),
            Err(status) => MutationOutcome::fail(status),
        };
        self.after_mutation();
        out
    }

    /// ADD.
    pub fn add(&self, item: Item, cookie: Cookie) -> MutationOutcome {
        if let Some(status) = self.write_gate() {
            return MutationOutcome::fail(status);
        }
        let out = match self.resolve(item.vbid) {
            Ok(vbucket) => vbucket.add(item, cookie),
            Err(status) => MutationOutcome::fail(status),
        };
        self.after_mutation();
        out
    }

    /// REPLACE.
    pub fn replace(&self, item: Item, cas: Cas, cookie: Cookie) -> MutationOutcome {
        if let Some(status) = self.write_gate() {
            return MutationOutcome::fail(status);
        }
        let out = match self.resolve(item.vbid) {
            Ok(vbucket) => vbucket.replace(item, cas, cookie),
            Err(status) => MutationOutcome::fail(status),
        };
        self.after_mutation();
        out
    }

    /// DELETE.
    pub fn delete(&self, vb: Vbid, key: &DocKey, cas: Cas, cookie: Cookie) -> MutationOutcome {
        if let Some(status) = self.write_gate() {
            return MutationOutcome::fail(status);
        }
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.del(key, cas, cookie),
            Err(status) => MutationOutcome::fail(status),
        }
    }

    /// GETL.
    pub fn get_locked(
        &self,
        vb: Vbid,
        key: &DocKey,
        lock_timeout: std::time::Duration,
        cookie: Cookie,
    ) -> GetOutcome {
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.get_locked(key, lock_timeout, cookie),
            Err(status) => GetOutcome::fail(status),
        }
    }

    /// UNLOCK.
    pub fn unlock(&self, vb: Vbid, key: &DocKey, cas: Cas, cookie: Cookie) -> Status {
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.unlock(key, cas, cookie),
            Err(status) => status,
        }
    }

    /// GAT.
    pub fn get_and_touch(
        &self,
        vb: Vbid,
        key: &DocKey,
        new_exptime: u32,
        cookie: Cookie,
    ) -> GetOutcome {
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.get_and_touch(key, new_exptime, cookie),
            Err(status) => GetOutcome::fail(status),
        }
    }

    /// TOUCH.
    pub fn touch(&self, vb: Vbid, key: &DocKey, new_exptime: u32, cookie: Cookie) -> MutationOutcome {
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.touch(key, new_exptime, cookie),
            Err(status) => MutationOutcome::fail(status),
        }
    }

    /// GET_META.
    pub fn get_meta(&self, vb: Vbid, key: &DocKey, cookie: Cookie) -> MetaOutcome {
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.get_meta(key, cookie),
            Err(status) => MetaOutcome::fail(status),
        }
    }

    /// SET_WITH_META.
    pub fn set_with_meta(&self, item: Item, cas: Cas, cookie: Cookie, force: bool) -> MutationOutcome {
        if let Some(status) = self.write_gate() {
            return MutationOutcome::fail(status);
        }
        let out = match self.resolve(item.vbid) {
            Ok(vbucket) => vbucket.set_with_meta(item, cas, cookie, force),
            Err(status) => MutationOutcome::fail(status),
        };
        self.after_mutation();
        out
    }

    /// DEL_WITH_META.
    pub fn del_with_meta(
        &self,
        vb: Vbid,
        key: &DocKey,
        meta: ItemMeta,
        cas: Cas,
        cookie: Cookie,
        force: bool,
    ) -> MutationOutcome {
        if let Some(status) = self.write_gate() {
            return MutationOutcome::fail(status);
        }
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.del_with_meta(key, meta, cas, cookie, force),
            Err(status) => MutationOutcome::fail(status),
        }
    }

    /// OBSERVE over a set of keys in one vbucket.
    pub fn observe(&self, vb: Vbid, keys: &[DocKey]) -> Result<Vec<ObserveResult>, Status> {
        let vbucket = self.resolve(vb)?;
        Ok(keys
            .iter()
            .map(|key| {
                let (state, cas) = vbucket.observe(key);
                ObserveResult { key: key.clone(), state, cas }
            })
            .collect())
    }

    /// OBSERVE_SEQNO.
    pub fn observe_seqno(&self, vb: Vbid, vb_uuid: u64) -> Result<ObserveSeqnoOutcome, Status> {
        let vbucket = self.resolve(vb)?;
        Ok(vbucket.observe_seqno(vb_uuid))
    }

    /// STOP_PERSISTENCE: flushers pause, mutations keep accumulating.
    pub fn stop_persistence(&self) {
        for shard in &self.shards {
            shard.flusher().pause();
        }
        for id in &self.flusher_tasks {
            self.pool.suspend(*id);
        }
        info!("bucket.persistence_stopped");
    }

    /// START_PERSISTENCE.
    pub fn start_persistence(&self) {
        for shard in &self.shards {
            shard.flusher().resume();
        }
        for id in &self.flusher_tasks {
            self.pool.resume(*id);
        }
        info!("bucket.persistence_started");
    }

    /// COMPACT_DB.
    pub fn compact_db(
        &self,
        vb: Vbid,
        purge_before_seqno: Seqno,
        drop_deletes: bool,
    ) -> Result<CompactionSummary, Status> {
        let vbucket = self.resolve(vb)?;
        let store = self.shards[self.config.shard_for(vb)].store();
        vbucket
            .compact(store.as_ref(), purge_before_seqno, drop_deletes)
            .map_err(|err| {
                warn!(vb = vb.0, error = %err, "bucket.compact_failed");
                Status::TempFailure
            })
    }

    /// SET_VBUCKET: creates the vbucket if missing, else transitions it.
    pub fn set_vbucket_state(&self, vb: Vbid, state: VBucketState) -> Status {
        if vb.0 >= self.config.max_vbuckets {
            return Status::InvalidArgument;
        }
        match self.vbmap.get(vb) {
            Some(vbucket) => {
                if vbucket.set_state(state) {
                    let store = self.shards[self.config.shard_for(vb)].store();
                    if let Err(err) = store.snapshot_vbucket(vb, &vbucket.state_record()) {
                        warn!(vb = vb.0, error = %err, "bucket.state_persist_failed");
                    } else {
                        vbucket.mark_file_created();
                    }
                    Status::Success
                } else {
                    Status::InvalidArgument
                }
            }
            None => {
                let shard = &self.shards[self.config.shard_for(vb)];
                let vbucket = VBucket::new(
                    vb,
                    state,
                    Arc::clone(&self.config),
                    Arc::clone(&self.stats),
                    Arc::clone(&self.jar),
                    Arc::clone(shard.notifier()),
                );
                self.vbmap.set(Arc::clone(&vbucket));
                let store = shard.store();
                if let Err(err) = store.snapshot_vbucket(vb, &vbucket.state_record()) {
                    warn!(vb = vb.0, error = %err, "bucket.state_persist_failed");
                } else {
                    vbucket.mark_file_created();
                }
                Status::Success
            }
        }
    }

    /// GET_VBUCKET.
    pub fn get_vbucket_state(&self, vb: Vbid) -> Option<VBucketState> {
        self.vbmap.get(vb).map(|vbucket| vbucket.state())
    }

    /// DEL_VBUCKET: rejects new ops, fails outstanding cookies with
    /// NotMyVbucket, drops memory, deletes the on-disk file.
    pub fn delete_vbucket(&self, vb: Vbid) -> Status {
        let Some(vbucket) = self.vbmap.remove(vb) else {
            return Status::NotMyVbucket;
        };
        vbucket.tear_down();
        let store = self.shards[self.config.shard_for(vb)].store();
        if let Err(err) = store.delete_vbucket(vb) {
            warn!(vb = vb.0, error = %err, "bucket.file_delete_failed");
            return Status::TempFailure;
        }
        info!(vb = vb.0, "bucket.vbucket_deleted");
        Status::Success
    }

    /// EVICT_KEY.
    pub fn evict_key(&self, vb: Vbid, key: &DocKey) -> Status {
        match self.resolve(vb) {
            Ok(vbucket) => vbucket.evict_key(key),
            Err(status) => status,
        }
    }

    /// GET_RANDOM_KEY across active vbuckets.
    pub fn get_random_key(&self) -> Option<(Vbid, DocKey)> {
        let live = self.vbmap.iter_live();
        if live.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        let start: usize = rng.gen_range(0..live.len());
        let seed: u64 = rng.gen();
        for off in 0..live.len() {
            let vb = &live[(start + off) % live.len()];
            if vb.state() != VBucketState::Active {
                continue;
            }
            if let Some(key) = vb.random_key(seed) {
                return Some((vb.id(), key));
            }
        }
        None
    }

    /// GET_KEYS: up to `count` live keys at or after `start`, sorted,
    /// from one vbucket. Under full eviction the on-disk key set is
    /// merged in.
    pub fn get_keys(
        &self,
        vb: Vbid,
        start: &DocKey,
        count: usize,
    ) -> Result<Vec<DocKey>, Status> {
        let vbucket = self.resolve(vb)?;
        if vbucket.state() != VBucketState::Active {
            return Err(Status::NotMyVbucket);
        }
        let mut keys: BTreeSet<DocKey> = vbucket
            .ht()
            .keys_where(|sv| !sv.is_deleted() && !sv.is_temp())
            .into_iter()
            .collect();
        if self.config.item_eviction_policy == EvictionPolicy::FullEviction {
            let store = self.shards[self.config.shard_for(vb)].store();
            let scan = store.scan(vb, 0, u64::MAX, ValueFilter::KeysOnly, &mut |item| {
                if !item.deleted {
                    keys.insert(item.key);
                }
                ScanContinue::Continue
            });
            if let Err(err) = scan {
                warn!(vb = vb.0, error = %err, "bucket.get_keys_scan_failed");
                return Err(Status::TempFailure);
            }
        }
        Ok(keys.into_iter().filter(|k| k >= start).take(count).collect())
    }

    /// GET_ALL_VB_SEQNOS, optionally filtered by state.
    pub fn get_all_vb_seqnos(&self, state: Option<VBucketState>) -> Vec<(Vbid, Seqno)> {
        self.vbmap
            .iter_live()
            .into_iter()
            .filter(|vb| state.map_or(true, |s| vb.state() == s))
            .map(|vb| (vb.id(), vb.high_seqno()))
            .collect()
    }

    /// Synchronously drains every flusher once (tests, orderly shutdown).
    pub fn flush_all(&self) {
        for shard in &self.shards {
            shard.flusher().flush_now();
        }
    }

    /// Orderly shutdown: final flush, stop flushers, stop the pool.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush_all();
        for shard in &self.shards {
            shard.flusher().stop();
        }
        self.pool.shutdown();
        info!("bucket.shutdown");
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            warn!("bucket.dropped_without_shutdown");
            self.shutdown();
        }
    }
}
