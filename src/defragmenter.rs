//! The defragmenter: periodically re-allocates long-lived value blobs.
//!
//! Allocators fragment when values of mixed sizes churn; copying an old
//! blob into a fresh allocation lets the allocator compact its pages.
//! Blobs age one step per pass and move once they cross the configured
//! age threshold; moved blobs restart at age zero.

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::executor::{TaskOutcome, TaskRunner};
use crate::stats::EngineStats;
use crate::vbucket::VBucketMap;

/// Blob-reallocation task.
pub struct Defragmenter {
    vbmap: Arc<VBucketMap>,
    config: Arc<Config>,
    stats: Arc<EngineStats>,
}

impl Defragmenter {
    /// Creates the defragmenter.
    pub fn new(
        vbmap: Arc<VBucketMap>,
        config: Arc<Config>,
        stats: Arc<EngineStats>,
    ) -> Arc<Defragmenter> {
        Arc::new(Defragmenter { vbmap, config, stats })
    }

    /// Wraps the defragmenter as an executor task.
    pub fn task(self: &Arc<Defragmenter>) -> Box<dyn TaskRunner> {
        Box::new(DefragmenterTask(Arc::clone(self)))
    }

    /// One pass over every table. Returns `(visited, moved)`.
    pub fn sweep(&self) -> (u64, u64) {
        let threshold = self.config.defragmenter_age_threshold;
        let mut visited = 0u64;
        let mut moved = 0u64;
        for vb in self.vbmap.iter_live() {
            vb.ht().for_each(|sv| {
                visited += 1;
                if sv.value().is_none() {
                    return;
                }
                if sv.blob_age() >= threshold {
                    if sv.realloc_value() {
                        moved += 1;
                    }
                } else {
                    sv.age_blob();
                }
            });
        }
        self.stats.add_defrag_visited(visited);
        self.stats.add_defrag_moved(moved);
        debug!(visited, moved, "defragmenter.sweep");
        (visited, moved)
    }
}

struct DefragmenterTask(Arc<Defragmenter>);

impl TaskRunner for DefragmenterTask {
    fn run(&self) -> TaskOutcome {
        self.0.sweep();
        TaskOutcome::Snooze(self.0.config.defragmenter_interval)
    }

    fn description(&self) -> String {
        "defragmenting value blobs".to_string()
    }
}
