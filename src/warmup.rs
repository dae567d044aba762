//! Warmup: rebuilds the memory image from disk at startup.
//!
//! A state machine driven by a Reader task, one step per execution slice:
//!
//! ```text
//! Initialize -> CreateVBuckets -> EstimateItemCount -> KeyDump
//!   -> CheckAccessLog -> LoadAccessLog -> LoadPreparedSyncWrites
//!   -> PopulateVBucketMap -> LoadingData -> Done
//! ```
//!
//! Value-eviction buckets load keys then values up to the configured
//! thresholds; full-eviction buckets skip both loads and fault items in
//! on demand. Running out of memory mid-warmup flips the bucket into
//! degraded mode (writes refused until traffic is enabled explicitly).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::access_scanner::{self, AccessScanner};
use crate::config::Config;
use crate::cookie::CookieJar;
use crate::executor::{TaskOutcome, TaskRunner};
use crate::item::Item;
use crate::kvstore::{KvStore, ScanContinue, VBucketStateRecord, ValueFilter};
use crate::shard::ShardNotifier;
use crate::stats::EngineStats;
use crate::types::{EvictionPolicy, Vbid};
use crate::vbucket::{VBucket, VBucketMap};

/// Warmup progress states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarmupState {
    /// Scanning the data directory.
    Initialize,
    /// Rebuilding vbucket objects from their state records.
    CreateVBuckets,
    /// Reading per-vbucket item counts.
    EstimateItemCount,
    /// Loading keys and metadata into the tables.
    KeyDump,
    /// Probing for an access log.
    CheckAccessLog,
    /// Loading the documents named by the access log.
    LoadAccessLog,
    /// Reserved step for durable-write recovery.
    LoadPreparedSyncWrites,
    /// Publishing vbuckets into the live map.
    PopulateVBucketMap,
    /// Loading remaining values up to the thresholds.
    LoadingData,
    /// Warmup complete.
    Done,
}

/// The startup loader.
pub struct Warmup {
    config: Arc<Config>,
    stats: Arc<EngineStats>,
    jar: Arc<CookieJar>,
    vbmap: Arc<VBucketMap>,
    stores: Vec<Arc<dyn KvStore>>,
    notifiers: Vec<Arc<ShardNotifier>>,
    traffic: Arc<AtomicBool>,
    state: Mutex<WarmupState>,
    created: Mutex<Vec<Arc<VBucket>>>,
    estimated_items: AtomicU64,
    loaded_values: AtomicU64,
    oom: AtomicBool,
    done: AtomicBool,
}

impl Warmup {
    /// Builds the warmup driver. `stores` and `notifiers` are indexed by
    /// shard.
    pub fn new(
        config: Arc<Config>,
        stats: Arc<EngineStats>,
        jar: Arc<CookieJar>,
        vbmap: Arc<VBucketMap>,
        stores: Vec<Arc<dyn KvStore>>,
        notifiers: Vec<Arc<ShardNotifier>>,
        traffic: Arc<AtomicBool>,
    ) -> Arc<Warmup> {
        Arc::new(Warmup {
            config,
            stats,
            jar,
            vbmap,
            stores,
            notifiers,
            traffic,
            state: Mutex::new(WarmupState::Initialize),
            created: Mutex::new(Vec::new()),
            estimated_items: AtomicU64::new(0),
            loaded_values: AtomicU64::new(0),
            oom: AtomicBool::new(false),
            done: AtomicBool::new(false),
        })
    }

    /// Wraps the warmup as an executor task.
    pub fn task(self: &Arc<Warmup>) -> Box<dyn TaskRunner> {
        Box::new(WarmupTask(Arc::clone(self)))
    }

    /// Current state.
    pub fn state(&self) -> WarmupState {
        *self.state.lock()
    }

    /// Whether warmup has finished (possibly degraded).
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn shard_of(&self, vb: Vbid) -> usize {
        vb.0 as usize % self.config.max_num_shards
    }

    fn advance(&self, to: WarmupState) {
        let mut state = self.state.lock();
        debug!(from = ?*state, to = ?to, "warmup.advance");
        *state = to;
    }

    fn full_eviction(&self) -> bool {
        self.config.item_eviction_policy == EvictionPolicy::FullEviction
    }

    fn over_memory_threshold(&self) -> bool {
        let cap = self.config.max_size / 100 * u64::from(self.config.warmup_min_memory_threshold);
        self.stats.mem_used() >= cap
    }

    fn over_item_threshold(&self) -> bool {
        let estimated = self.estimated_items.load(Ordering::Acquire);
        if estimated == 0 {
            return false;
        }
        let cap = estimated * u64::from(self.config.warmup_min_items_threshold) / 100;
        self.loaded_values.load(Ordering::Acquire) >= cap
    }

    fn check_oom(&self) -> bool {
        if self.stats.mem_used() >= self.config.max_size {
            self.oom.store(true, Ordering::Release);
            warn!("warmup.oom");
            return true;
        }
        false
    }

    fn step(&self) -> TaskOutcome {
        let state = self.state();
        match state {
            WarmupState::Initialize => {
                info!(shards = self.stores.len(), "warmup.begin");
                self.advance(WarmupState::CreateVBuckets);
            }
            WarmupState::CreateVBuckets => {
                if let Err(err) = self.create_vbuckets() {
                    warn!(error = %err, "warmup.create_vbuckets_failed");
                }
                self.advance(WarmupState::EstimateItemCount);
            }
            WarmupState::EstimateItemCount => {
                self.estimate_item_counts();
                let next = if self.full_eviction() {
                    WarmupState::CheckAccessLog
                } else {
                    WarmupState::KeyDump
                };
                self.advance(next);
            }
            WarmupState::KeyDump => {
                self.key_dump();
                self.advance(WarmupState::CheckAccessLog);
            }
            WarmupState::CheckAccessLog => {
                let found = self.check_access_log();
                let next = if found {
                    WarmupState::LoadAccessLog
                } else {
                    WarmupState::LoadPreparedSyncWrites
                };
                self.advance(next);
            }
            WarmupState::LoadAccessLog => {
                self.load_access_log();
                self.advance(WarmupState::LoadPreparedSyncWrites);
            }
            WarmupState::LoadPreparedSyncWrites => {
                // Synchronous durability is not part of this engine; the
                // step exists so the state sequence matches the on-disk
                // format's capabilities.
                self.advance(WarmupState::PopulateVBucketMap);
            }
            WarmupState::PopulateVBucketMap => {
                self.populate_vbucket_map();
                self.advance(WarmupState::LoadingData);
            }
            WarmupState::LoadingData => {
                if !self.full_eviction() && !self.oom.load(Ordering::Acquire) {
                    self.loading_data();
                }
                self.advance(WarmupState::Done);
            }
            WarmupState::Done => {
                self.finish();
                return TaskOutcome::Done;
            }
        }
        TaskOutcome::Reschedule
    }

    fn create_vbuckets(&self) -> crate::error::Result<()> {
        let mut discovered: Vec<(Vbid, VBucketStateRecord)> = Vec::new();
        for store in &self.stores {
            discovered.extend(store.list_persisted_vbuckets()?);
        }
        discovered.sort_by_key(|(vb, _)| vb.0);
        discovered.dedup_by_key(|(vb, _)| vb.0);
        let mut created = self.created.lock();
        for (vbid, record) in &discovered {
            let notifier = Arc::clone(&self.notifiers[self.shard_of(*vbid)]);
            let vb = VBucket::from_warmup(
                *vbid,
                record,
                Arc::clone(&self.config),
                Arc::clone(&self.stats),
                Arc::clone(&self.jar),
                notifier,
            );
            created.push(vb);
        }
        info!(vbuckets = created.len(), "warmup.vbuckets_created");
        Ok(())
    }

    fn estimate_item_counts(&self) {
        let created = self.created.lock();
        let mut total = 0u64;
        for vb in created.iter() {
            let store = &self.stores[self.shard_of(vb.id())];
            match store.get_item_count(vb.id()) {
                Ok(count) => {
                    vb.ht().set_num_total_items(count as usize);
                    total += count;
                }
                Err(err) => warn!(vb = vb.id().0, error = %err, "warmup.estimate_failed"),
            }
        }
        self.estimated_items.store(total, Ordering::Release);
        info!(estimated = total, "warmup.estimated");
    }

    fn key_dump(&self) {
        let created = self.created.lock();
        for vb in created.iter() {
            if self.check_oom() {
                return;
            }
            let store = &self.stores[self.shard_of(vb.id())];
            let stats = &self.stats;
            let result = store.scan(vb.id(), 0, u64::MAX, ValueFilter::KeysOnly, &mut |item: Item| {
                if !item.deleted {
                    let mut guard = vb.ht().lock_key(&item.key);
                    if guard.depth_of(&item.key, true).is_none() {
                        guard.insert(crate::hash_table::StoredValue::from_item(&item, false));
                        stats.inc_warmed_up_keys();
                    }
                }
                if stats.mem_used() >= self.config.max_size {
                    ScanContinue::Stop
                } else {
                    ScanContinue::Continue
                }
            });
            if let Err(err) = result {
                warn!(vb = vb.id().0, error = %err, "warmup.key_dump_failed");
            }
        }
        info!(keys = self.stats.warmed_up_keys(), "warmup.key_dump_done");
    }

    fn check_access_log(&self) -> bool {
        (0..self.config.max_num_shards).any(|shard| {
            let path = AccessScanner::log_path(&self.config, shard);
            path.exists() || access_scanner::rotated_path(&path).exists()
        })
    }

    fn load_access_log(&self) {
        let mut entries = Vec::new();
        for shard in 0..self.config.max_num_shards {
            let path = AccessScanner::log_path(&self.config, shard);
            let from = if path.exists() { path } else { access_scanner::rotated_path(&path) };
            match access_scanner::read_access_log(&from) {
                Ok(mut found) => entries.append(&mut found),
                Err(err) => warn!(shard, error = %err, "warmup.access_log_unreadable"),
            }
        }
        let created = self.created.lock();
        for (vbid, key) in &entries {
            if self.check_oom() || self.over_item_threshold() || self.over_memory_threshold() {
                break;
            }
            let Some(vb) = created.iter().find(|vb| vb.id() == *vbid) else {
                continue;
            };
            let store = &self.stores[self.shard_of(*vbid)];
            match store.get(*vbid, key) {
                Ok(Some(item)) if !item.deleted => self.load_one(vb, &item),
                Ok(_) => {}
                Err(err) => warn!(vb = vbid.0, error = %err, "warmup.access_load_failed"),
            }
        }
        info!(values = self.loaded_values.load(Ordering::Acquire), "warmup.access_log_done");
    }

    fn load_one(&self, vb: &Arc<VBucket>, item: &Item) {
        let mut guard = vb.ht().lock_key(&item.key);
        match guard.depth_of(&item.key, true) {
            Some(depth) => {
                if !guard.sv(depth).is_resident() && !guard.sv(depth).is_temp() {
                    guard.restore_value(depth, item);
                    self.stats.inc_warmed_up_values();
                    self.loaded_values.fetch_add(1, Ordering::AcqRel);
                }
            }
            None => {
                guard.insert(crate::hash_table::StoredValue::from_item(item, false));
                self.stats.inc_warmed_up_values();
                self.loaded_values.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    fn populate_vbucket_map(&self) {
        let created = self.created.lock();
        for vb in created.iter() {
            self.vbmap.set(Arc::clone(vb));
        }
        info!(vbuckets = created.len(), "warmup.map_populated");
    }

    fn loading_data(&self) {
        let created = self.created.lock();
        'outer: for vb in created.iter() {
            let store = &self.stores[self.shard_of(vb.id())];
            let mut stop = false;
            let result = store.scan(vb.id(), 0, u64::MAX, ValueFilter::Values, &mut |item: Item| {
                if item.deleted {
                    return ScanContinue::Continue;
                }
                self.load_one(vb, &item);
                if self.check_oom() || self.over_item_threshold() || self.over_memory_threshold() {
                    stop = true;
                    return ScanContinue::Stop;
                }
                ScanContinue::Continue
            });
            if let Err(err) = result {
                warn!(vb = vb.id().0, error = %err, "warmup.load_failed");
            }
            if stop {
                break 'outer;
            }
        }
        info!(values = self.loaded_values.load(Ordering::Acquire), "warmup.data_loaded");
    }

    fn finish(&self) {
        let created = self.created.lock();
        for vb in created.iter() {
            vb.extend_failover_for_restart();
        }
        let oom = self.oom.load(Ordering::Acquire);
        if oom {
            self.stats.inc_warmup_oom();
            warn!("warmup.done_degraded");
        } else {
            self.traffic.store(true, Ordering::Release);
            info!(
                keys = self.stats.warmed_up_keys(),
                values = self.stats.warmed_up_values(),
                "warmup.done"
            );
        }
        self.done.store(true, Ordering::Release);
    }
}

struct WarmupTask(Arc<Warmup>);

impl TaskRunner for WarmupTask {
    fn run(&self) -> TaskOutcome {
        self.0.step()
    }

    fn description(&self) -> String {
        format!("warming up ({:?})", self.0.state())
    }
}
