//! Shards: the unit of disk parallelism.
//!
//! Vbucket `v` belongs to shard `v % S`. Each shard owns one KV store
//! handle, one flusher, and one background fetcher; the executor pool
//! runs both as tasks, woken through the shard's notifier whenever a
//! vbucket queues work for them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::bgfetcher::BgFetcher;
use crate::config::Config;
use crate::cookie::CookieJar;
use crate::executor::{ExecutorPool, TaskId, TaskOptions, TaskType};
use crate::flusher::Flusher;
use crate::kvstore::KvStore;
use crate::stats::EngineStats;
use crate::vbucket::VBucketMap;

/// Wakes a shard's flusher and fetcher tasks. Vbuckets hold one of these
/// so a mutation can nudge the right task without reaching back into the
/// bucket.
pub struct ShardNotifier {
    pool: RwLock<Weak<ExecutorPool>>,
    flusher_task: AtomicU64,
    bgfetch_task: AtomicU64,
}

impl ShardNotifier {
    /// A notifier with nothing attached; wakes are dropped until
    /// [`ShardNotifier::connect`] runs. Also handy in unit tests.
    pub fn disconnected() -> Arc<ShardNotifier> {
        Arc::new(ShardNotifier {
            pool: RwLock::new(Weak::new()),
            flusher_task: AtomicU64::new(0),
            bgfetch_task: AtomicU64::new(0),
        })
    }

    /// Attaches the pool and the two task ids.
    pub fn connect(&self, pool: &Arc<ExecutorPool>, flusher: TaskId, bgfetcher: TaskId) {
        *self.pool.write() = Arc::downgrade(pool);
        self.flusher_task.store(flusher.0, Ordering::Release);
        self.bgfetch_task.store(bgfetcher.0, Ordering::Release);
    }

    /// Wakes the shard's flusher task.
    pub fn notify_flusher(&self) {
        let id = self.flusher_task.load(Ordering::Acquire);
        if id == 0 {
            return;
        }
        if let Some(pool) = self.pool.read().upgrade() {
            pool.wake(TaskId(id));
        }
    }

    /// Wakes the shard's background fetcher task.
    pub fn notify_bgfetcher(&self) {
        let id = self.bgfetch_task.load(Ordering::Acquire);
        if id == 0 {
            return;
        }
        if let Some(pool) = self.pool.read().upgrade() {
            pool.wake(TaskId(id));
        }
    }
}

/// One shard: store handle plus its writer and reader tasks.
pub struct Shard {
    id: usize,
    store: Arc<dyn KvStore>,
    notifier: Arc<ShardNotifier>,
    flusher: Arc<Flusher>,
    bgfetcher: Arc<BgFetcher>,
}

impl Shard {
    /// Builds a shard over its store handle.
    pub fn new(
        id: usize,
        store: Arc<dyn KvStore>,
        vbmap: Arc<VBucketMap>,
        config: Arc<Config>,
        stats: Arc<EngineStats>,
        jar: Arc<CookieJar>,
    ) -> Arc<Shard> {
        let notifier = ShardNotifier::disconnected();
        let flusher = Flusher::new(
            id,
            Arc::clone(&vbmap),
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&stats),
        );
        let bgfetcher = BgFetcher::new(id, vbmap, Arc::clone(&store), config, jar);
        Arc::new(Shard { id, store, notifier, flusher, bgfetcher })
    }

    /// Shard index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The shard's KV store handle.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// The shard's notifier, for vbucket construction.
    pub fn notifier(&self) -> &Arc<ShardNotifier> {
        &self.notifier
    }

    /// The shard's flusher.
    pub fn flusher(&self) -> &Arc<Flusher> {
        &self.flusher
    }

    /// The shard's background fetcher.
    pub fn bgfetcher(&self) -> &Arc<BgFetcher> {
        &self.bgfetcher
    }

    /// Schedules the flusher and fetcher on the pool and wires the
    /// notifier up to them. Returns `(flusher, bgfetcher)` task ids.
    pub fn schedule_tasks(&self, pool: &Arc<ExecutorPool>) -> (TaskId, TaskId) {
        let flusher_id = pool.schedule(
            self.flusher.task(),
            TaskType::Writer,
            TaskOptions { priority: 1, ..Default::default() },
        );
        let bgfetch_id = pool.schedule(
            self.bgfetcher.task(),
            TaskType::Reader,
            TaskOptions { priority: 1, ..Default::default() },
        );
        self.notifier.connect(pool, flusher_id, bgfetch_id);
        debug!(
            shard = self.id,
            flusher = flusher_id.0,
            bgfetcher = bgfetch_id.0,
            "shard.tasks_scheduled"
        );
        (flusher_id, bgfetch_id)
    }
}
