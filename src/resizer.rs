//! Hash table resizer task.
//!
//! Periodically nudges each vbucket's table toward one item per bucket.
//! Resizing defers to in-flight visitors; a skipped table is simply
//! retried on the next pass.

use std::sync::Arc;

use tracing::debug;

use crate::config::Config;
use crate::executor::{TaskOutcome, TaskRunner};
use crate::vbucket::VBucketMap;

/// Table-resizing task.
pub struct HashtableResizer {
    vbmap: Arc<VBucketMap>,
    config: Arc<Config>,
}

impl HashtableResizer {
    /// Creates the resizer.
    pub fn new(vbmap: Arc<VBucketMap>, config: Arc<Config>) -> Arc<HashtableResizer> {
        Arc::new(HashtableResizer { vbmap, config })
    }

    /// Wraps the resizer as an executor task.
    pub fn task(self: &Arc<HashtableResizer>) -> Box<dyn TaskRunner> {
        Box::new(ResizerTask(Arc::clone(self)))
    }

    /// One pass over every table. Returns the number resized.
    pub fn sweep(&self) -> usize {
        let mut resized = 0;
        for vb in self.vbmap.iter_live() {
            if let Some(new_size) = vb.ht().resize_if_needed() {
                debug!(vb = vb.id().0, new_size, "resizer.resized");
                resized += 1;
            }
        }
        resized
    }
}

struct ResizerTask(Arc<HashtableResizer>);

impl TaskRunner for ResizerTask {
    fn run(&self) -> TaskOutcome {
        self.0.sweep();
        TaskOutcome::Snooze(self.0.config.ht_resizer_interval)
    }

    fn description(&self) -> String {
        "adjusting hash table sizes".to_string()
    }
}
