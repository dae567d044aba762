//! The flusher: one batching disk writer per shard.
//!
//! Round-robins its shard's vbuckets, drains each persistence cursor into
//! a capped batch, writes the batch plus the vbucket state record inside
//! one store transaction, and runs the persistence callbacks on success.
//! A failed commit leaves every item dirty and parks the batch for the
//! next pass.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::Result;
use crate::executor::{TaskOutcome, TaskRunner};
use crate::item::Item;
use crate::kvstore::KvStore;
use crate::stats::EngineStats;
use crate::types::{VBucketState, Vbid};
use crate::vbucket::{VBucket, VBucketMap};

/// Flusher lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlusherState {
    /// Constructed, not yet run.
    Initializing,
    /// Draining checkpoints.
    Running,
    /// Idle between passes.
    Snoozed,
    /// Pause requested; takes effect at the next pass boundary.
    Pausing,
    /// Mutations accumulate, nothing is written.
    Paused,
    /// Stop requested.
    Stopping,
    /// Terminal.
    Stopped,
}

impl FlusherState {
    fn from_u8(v: u8) -> FlusherState {
        match v {
            0 => FlusherState::Initializing,
            1 => FlusherState::Running,
            2 => FlusherState::Snoozed,
            3 => FlusherState::Pausing,
            4 => FlusherState::Paused,
            5 => FlusherState::Stopping,
            _ => FlusherState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FlusherState::Initializing => 0,
            FlusherState::Running => 1,
            FlusherState::Snoozed => 2,
            FlusherState::Pausing => 3,
            FlusherState::Paused => 4,
            FlusherState::Stopping => 5,
            FlusherState::Stopped => 6,
        }
    }
}

const IDLE_SNOOZE: Duration = Duration::from_millis(1000);
const PAUSED_SNOOZE: Duration = Duration::from_millis(250);

/// Batching writer for one shard.
pub struct Flusher {
    shard_id: usize,
    vbmap: Arc<VBucketMap>,
    store: Arc<dyn KvStore>,
    config: Arc<Config>,
    stats: Arc<EngineStats>,
    state: AtomicU8,
    retry: Mutex<FxHashMap<Vbid, Vec<Item>>>,
    gate: Mutex<()>,
}

impl Flusher {
    /// Creates the flusher for `shard_id`.
    pub fn new(
        shard_id: usize,
        vbmap: Arc<VBucketMap>,
        store: Arc<dyn KvStore>,
        config: Arc<Config>,
        stats: Arc<EngineStats>,
    ) -> Arc<Flusher> {
        Arc::new(Flusher {
            shard_id,
            vbmap,
            store,
            config,
            stats,
            state: AtomicU8::new(FlusherState::Initializing.as_u8()),
            retry: Mutex::new(FxHashMap::default()),
            gate: Mutex::new(()),
        })
    }

    /// Current state.
    pub fn state(&self) -> FlusherState {
        FlusherState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: FlusherState) {
        self.state.store(state.as_u8(), Ordering::Release);
        trace!(shard = self.shard_id, ?state, "flusher.state");
    }

    /// Requests a pause; mutations keep accumulating in checkpoints.
    pub fn pause(&self) {
        match self.state() {
            FlusherState::Stopping | FlusherState::Stopped => {}
            _ => self.set_state(FlusherState::Pausing),
        }
    }

    /// Resumes disk writes.
    pub fn resume(&self) {
        match self.state() {
            FlusherState::Pausing | FlusherState::Paused => self.set_state(FlusherState::Running),
            _ => {}
        }
    }

    /// Requests a stop; the task dies at its next pass boundary.
    pub fn stop(&self) {
        self.set_state(FlusherState::Stopping);
    }

    /// Wraps the flusher as an executor task.
    pub fn task(self: &Arc<Flusher>) -> Box<dyn TaskRunner> {
        Box::new(FlusherTask(Arc::clone(self)))
    }

    /// Synchronously drains the shard once, regardless of task cadence.
    /// Used at orderly shutdown so nothing dirty is left behind.
    pub fn flush_now(&self) {
        self.flush_shard();
    }

    /// One pass over the shard's vbuckets. Returns true when any vbucket
    /// still has more queued than the batch cap drained.
    fn flush_shard(&self) -> bool {
        let _gate = self.gate.lock();
        let mut more = false;
        for vb in self.vbmap.iter_shard(self.shard_id, self.config.max_num_shards) {
            if vb.state() == VBucketState::Dead {
                continue;
            }
            match self.flush_vbucket(&vb) {
                Ok(had_more) => more |= had_more,
                Err(err) => {
                    self.stats.inc_item_commit_failed();
                    self.stats.inc_vb_ops_reject();
                    warn!(
                        shard = self.shard_id,
                        vb = vb.id().0,
                        error = %err,
                        "flusher.commit_failed"
                    );
                }
            }
        }
        more
    }

    fn flush_vbucket(&self, vb: &Arc<VBucket>) -> Result<bool> {
        let retry_items = self.retry.lock().remove(&vb.id()).unwrap_or_default();
        let batch = vb
            .checkpoints()
            .drain_for_persistence(self.config.compaction_write_queue_cap);
        if batch.items.is_empty() && retry_items.is_empty() && !vb.is_bucket_creation() {
            return Ok(false);
        }

        let mut items = retry_items;
        items.extend(batch.items.iter().cloned());

        let vbid = vb.id();
        let result: Result<()> = (|| {
            self.store.begin(vbid)?;
            for item in &items {
                if item.deleted {
                    self.store.del(item)?;
                } else {
                    self.store.set(item)?;
                }
            }
            let mut record = vb.state_record();
            record.checkpoint_id = batch.checkpoint_id;
            if batch.snap_end > 0 {
                record.snap_start = batch.snap_start;
                record.snap_end = batch.snap_end;
            }
            self.store.snapshot_vbucket(vbid, &record)?;
            self.store.commit(vbid)
        })();

        match result {
            Ok(()) => {
                vb.mark_file_created();
                for item in &items {
                    vb.complete_flush(item);
                }
                if batch.snap_end > 0 {
                    vb.post_commit(batch.snap_start, batch.snap_end);
                }
                self.stats.add_total_persisted(items.len() as u64);
                debug!(
                    shard = self.shard_id,
                    vb = vbid.0,
                    items = items.len(),
                    snap_end = batch.snap_end,
                    "flusher.commit"
                );
                Ok(batch.more)
            }
            Err(err) => {
                let _ = self.store.rollback(vbid);
                // Keep the batch for the next pass; items stay dirty.
                self.retry.lock().entry(vbid).or_default().extend(items);
                Err(err)
            }
        }
    }
}

struct FlusherTask(Arc<Flusher>);

impl TaskRunner for FlusherTask {
    fn run(&self) -> TaskOutcome {
        let flusher = &self.0;
        match flusher.state() {
            FlusherState::Initializing => flusher.set_state(FlusherState::Running),
            FlusherState::Snoozed => flusher.set_state(FlusherState::Running),
            _ => {}
        }
        match flusher.state() {
            FlusherState::Pausing => {
                flusher.set_state(FlusherState::Paused);
                return TaskOutcome::Snooze(PAUSED_SNOOZE);
            }
            FlusherState::Paused => return TaskOutcome::Snooze(PAUSED_SNOOZE),
            FlusherState::Stopping => {
                flusher.set_state(FlusherState::Stopped);
                return TaskOutcome::Done;
            }
            FlusherState::Stopped => return TaskOutcome::Done,
            _ => {}
        }
        let more = flusher.flush_shard();
        if more {
            TaskOutcome::Reschedule
        } else {
            flusher.set_state(FlusherState::Snoozed);
            TaskOutcome::Snooze(IDLE_SNOOZE)
        }
    }

    fn description(&self) -> String {
        format!("flusher for shard {}", self.0.shard_id)
    }
}
