//! Bucket-wide counters.
//!
//! Plain relaxed atomics with a point-in-time snapshot type. The memory
//! gauge guards against underflow: a decrement past zero clamps to zero
//! and is logged instead of wrapping.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

/// Counters maintained by the engine. Incremented from hot paths with
/// relaxed ordering; read via the accessor methods or [`EngineStats::snapshot`].
#[derive(Default)]
pub struct EngineStats {
    mem_used: AtomicU64,
    expired_access: AtomicU64,
    expired_pager: AtomicU64,
    expired_compactor: AtomicU64,
    total_persisted: AtomicU64,
    item_commit_failed: AtomicU64,
    items_rm_from_checkpoints: AtomicU64,
    bg_fetched: AtomicU64,
    bg_meta_fetched: AtomicU64,
    num_value_ejects: AtomicU64,
    num_eject_failures: AtomicU64,
    warmup_oom: AtomicU64,
    warmed_up_keys: AtomicU64,
    warmed_up_values: AtomicU64,
    num_pager_runs: AtomicU64,
    num_expiry_pager_runs: AtomicU64,
    defrag_num_visited: AtomicU64,
    defrag_num_moved: AtomicU64,
    bloom_filter_skips: AtomicU64,
    access_scanner_runs: AtomicU64,
    access_scanner_skips: AtomicU64,
    vb_ops_reject: AtomicU64,
    hlc_drift_ahead: AtomicU64,
    hlc_drift_behind: AtomicU64,
    vb_active_expired: AtomicU64,
    vb_replica_expired: AtomicU64,
    vb_pending_expired: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    /// Estimated bytes held by in-memory items.
    pub mem_used: u64,
    /// Items found expired on the access path.
    pub expired_access: u64,
    /// Items deleted by the expiry pager.
    pub expired_pager: u64,
    /// Items expired while compacting.
    pub expired_compactor: u64,
    /// Mutations confirmed on disk.
    pub total_persisted: u64,
    /// Flusher commits that failed and will be retried.
    pub item_commit_failed: u64,
    /// Entries freed from closed checkpoints.
    pub items_rm_from_checkpoints: u64,
    /// Full background fetches completed.
    pub bg_fetched: u64,
    /// Metadata-only background fetches completed.
    pub bg_meta_fetched: u64,
    /// Values ejected from memory.
    pub num_value_ejects: u64,
    /// Ejection attempts refused (dirty or locked items).
    pub num_eject_failures: u64,
    /// Warmup aborted early for memory.
    pub warmup_oom: u64,
    /// Keys loaded during warmup key dump.
    pub warmed_up_keys: u64,
    /// Values loaded during warmup data load.
    pub warmed_up_values: u64,
    /// Item pager passes completed.
    pub num_pager_runs: u64,
    /// Expiry pager passes completed.
    pub num_expiry_pager_runs: u64,
    /// Stored values inspected by the defragmenter.
    pub defrag_num_visited: u64,
    /// Value blobs re-allocated by the defragmenter.
    pub defrag_num_moved: u64,
    /// Disk probes avoided by a bloom-filter reject.
    pub bloom_filter_skips: u64,
    /// Access scanner passes that wrote a log.
    pub access_scanner_runs: u64,
    /// Access scanner passes skipped for high residency.
    pub access_scanner_skips: u64,
    /// Writes rejected by vbucket state or back-pressure.
    pub vb_ops_reject: u64,
    /// Incoming CAS ahead of the local clock beyond the threshold.
    pub hlc_drift_ahead: u64,
    /// Incoming CAS behind the local clock beyond the threshold.
    pub hlc_drift_behind: u64,
    /// Expirations observed on active vbuckets.
    pub vb_active_expired: u64,
    /// Expirations observed on replica vbuckets.
    pub vb_replica_expired: u64,
    /// Expirations observed on pending vbuckets.
    pub vb_pending_expired: u64,
}

macro_rules! bump {
    ($name:ident, $inc:ident) => {
        /// Increments the counter by one.
        pub fn $inc(&self) {
            self.$name.fetch_add(1, Ordering::Relaxed);
        }

        /// Current value of the counter.
        pub fn $name(&self) -> u64 {
            self.$name.load(Ordering::Relaxed)
        }
    };
}

impl EngineStats {
    bump!(expired_access, inc_expired_access);
    bump!(expired_pager, inc_expired_pager);
    bump!(expired_compactor, inc_expired_compactor);
    bump!(item_commit_failed, inc_item_commit_failed);
    bump!(bg_fetched, inc_bg_fetched);
    bump!(bg_meta_fetched, inc_bg_meta_fetched);
    bump!(num_value_ejects, inc_num_value_ejects);
    bump!(num_eject_failures, inc_num_eject_failures);
    bump!(warmup_oom, inc_warmup_oom);
    bump!(warmed_up_keys, inc_warmed_up_keys);
    bump!(warmed_up_values, inc_warmed_up_values);
    bump!(num_pager_runs, inc_num_pager_runs);
    bump!(num_expiry_pager_runs, inc_num_expiry_pager_runs);
    bump!(defrag_num_visited, inc_defrag_num_visited);
    bump!(defrag_num_moved, inc_defrag_num_moved);
    bump!(bloom_filter_skips, inc_bloom_filter_skips);
    bump!(access_scanner_runs, inc_access_scanner_runs);
    bump!(access_scanner_skips, inc_access_scanner_skips);
    bump!(vb_ops_reject, inc_vb_ops_reject);
    bump!(hlc_drift_ahead, inc_hlc_drift_ahead);
    bump!(hlc_drift_behind, inc_hlc_drift_behind);
    bump!(vb_active_expired, inc_vb_active_expired);
    bump!(vb_replica_expired, inc_vb_replica_expired);
    bump!(vb_pending_expired, inc_vb_pending_expired);

    /// Adds `n` to the persisted-mutation counter.
    pub fn add_total_persisted(&self, n: u64) {
        self.total_persisted.fetch_add(n, Ordering::Relaxed);
    }

    /// Mutations confirmed on disk so far.
    pub fn total_persisted(&self) -> u64 {
        self.total_persisted.load(Ordering::Relaxed)
    }

    /// Adds `n` to the reclaimed-checkpoint-entry counter.
    pub fn add_items_rm_from_checkpoints(&self, n: u64) {
        self.items_rm_from_checkpoints.fetch_add(n, Ordering::Relaxed);
    }

    /// Entries freed from closed checkpoints so far.
    pub fn items_rm_from_checkpoints(&self) -> u64 {
        self.items_rm_from_checkpoints.load(Ordering::Relaxed)
    }

    /// Adds `n` to the defragmenter visited counter.
    pub fn add_defrag_visited(&self, n: u64) {
        self.defrag_num_visited.fetch_add(n, Ordering::Relaxed);
    }

    /// Adds `n` to the defragmenter moved counter.
    pub fn add_defrag_moved(&self, n: u64) {
        self.defrag_num_moved.fetch_add(n, Ordering::Relaxed);
    }

    /// Accounts `bytes` of newly held memory.
    pub fn mem_grow(&self, bytes: u64) {
        self.mem_used.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Releases `bytes` of accounted memory. Clamps at zero: the counters
    /// must never wrap, so an underflow is logged and the gauge floors.
    pub fn mem_shrink(&self, bytes: u64) {
        let mut cur = self.mem_used.load(Ordering::Relaxed);
        loop {
            let next = match cur.checked_sub(bytes) {
                Some(v) => v,
                None => {
                    warn!(current = cur, release = bytes, "stats.mem_used.underflow");
                    0
                }
            };
            match self.mem_used.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Estimated bytes held by in-memory items.
    pub fn mem_used(&self) -> u64 {
        self.mem_used.load(Ordering::Relaxed)
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            mem_used: self.mem_used(),
            expired_access: self.expired_access(),
            expired_pager: self.expired_pager(),
            expired_compactor: self.expired_compactor(),
            total_persisted: self.total_persisted(),
            item_commit_failed: self.item_commit_failed(),
            items_rm_from_checkpoints: self.items_rm_from_checkpoints(),
            bg_fetched: self.bg_fetched(),
            bg_meta_fetched: self.bg_meta_fetched(),
            num_value_ejects: self.num_value_ejects(),
            num_eject_failures: self.num_eject_failures(),
            warmup_oom: self.warmup_oom(),
            warmed_up_keys: self.warmed_up_keys(),
            warmed_up_values: self.warmed_up_values(),
            num_pager_runs: self.num_pager_runs(),
            num_expiry_pager_runs: self.num_expiry_pager_runs(),
            defrag_num_visited: self.defrag_num_visited(),
            defrag_num_moved: self.defrag_num_moved(),
            bloom_filter_skips: self.bloom_filter_skips(),
            access_scanner_runs: self.access_scanner_runs(),
            access_scanner_skips: self.access_scanner_skips(),
            vb_ops_reject: self.vb_ops_reject(),
            hlc_drift_ahead: self.hlc_drift_ahead(),
            hlc_drift_behind: self.hlc_drift_behind(),
            vb_active_expired: self.vb_active_expired(),
            vb_replica_expired: self.vb_replica_expired(),
            vb_pending_expired: self.vb_pending_expired(),
        }
    }

    /// Bumps the per-state expiration counter for the given vbucket state.
    pub fn inc_vb_expired(&self, state: crate::types::VBucketState) {
        match state {
            crate::types::VBucketState::Active => self.inc_vb_active_expired(),
            crate::types::VBucketState::Replica => self.inc_vb_replica_expired(),
            crate::types::VBucketState::Pending => self.inc_vb_pending_expired(),
            crate::types::VBucketState::Dead => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_gauge_clamps_instead_of_wrapping() {
        let stats = EngineStats::default();
        stats.mem_grow(100);
        stats.mem_shrink(40);
        assert_eq!(stats.mem_used(), 60);
        stats.mem_shrink(1000);
        assert_eq!(stats.mem_used(), 0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = EngineStats::default();
        stats.inc_expired_access();
        stats.inc_expired_access();
        stats.add_total_persisted(5);
        let snap = stats.snapshot();
        assert_eq!(snap.expired_access, 2);
        assert_eq!(snap.total_persisted, 5);
        assert_eq!(snap.expired_pager, 0);
    }
}
