//! The expiry pager: reaps items whose TTL has passed.
//!
//! An AuxIO task sweeping each active vbucket's hash table on a fixed
//! interval, optionally anchored to a wall-clock hour for its first run.
//! Each stale item gets a real tombstone with a fresh seqno; normal
//! conflict resolution does not apply to these local deletions.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use crate::config::Config;
use crate::executor::{TaskOutcome, TaskRunner};
use crate::item::unix_now;
use crate::stats::EngineStats;
use crate::types::VBucketState;
use crate::vbucket::{ExpirySource, VBucketMap};

/// TTL-reaping task.
pub struct ExpiryPager {
    vbmap: Arc<VBucketMap>,
    config: Arc<Config>,
    stats: Arc<EngineStats>,
}

impl ExpiryPager {
    /// Creates the pager.
    pub fn new(
        vbmap: Arc<VBucketMap>,
        config: Arc<Config>,
        stats: Arc<EngineStats>,
    ) -> Arc<ExpiryPager> {
        Arc::new(ExpiryPager { vbmap, config, stats })
    }

    /// Wraps the pager as an executor task.
    pub fn task(self: &Arc<ExpiryPager>) -> Box<dyn TaskRunner> {
        Box::new(ExpiryPagerTask(Arc::clone(self)))
    }

    /// One sweep over every active vbucket. Returns deletions made.
    pub fn sweep(&self) -> usize {
        let now = unix_now();
        let mut reaped = 0usize;
        for vb in self.vbmap.iter_live() {
            if vb.state() != VBucketState::Active {
                continue;
            }
            let stale = vb.ht().keys_where(|sv| sv.is_expired_at(now));
            for key in stale {
                if vb.expire_if_needed(&key, ExpirySource::Pager) {
                    reaped += 1;
                }
            }
        }
        self.stats.inc_num_expiry_pager_runs();
        debug!(reaped, "expirypager.sweep");
        reaped
    }
}

struct ExpiryPagerTask(Arc<ExpiryPager>);

impl TaskRunner for ExpiryPagerTask {
    fn run(&self) -> TaskOutcome {
        self.0.sweep();
        TaskOutcome::Snooze(self.0.config.exp_pager_stime)
    }

    fn description(&self) -> String {
        "paging expired items".to_string()
    }
}

/// Delay from now until the next wall-clock occurrence of `hour` (0-23),
/// used to anchor the first run of hour-scheduled tasks.
pub fn delay_until_hour(hour: u8) -> Duration {
    let now = OffsetDateTime::now_utc();
    let hour = i64::from(hour.min(23));
    let seconds_today = i64::from(now.hour()) * 3600 + i64::from(now.minute()) * 60 + i64::from(now.second());
    let target = hour * 3600;
    let mut wait = target - seconds_today;
    if wait <= 0 {
        wait += 24 * 3600;
    }
    Duration::from_secs(wait as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_delay_is_within_a_day() {
        for hour in 0..24u8 {
            let d = delay_until_hour(hour);
            assert!(d <= Duration::from_secs(24 * 3600));
            assert!(d > Duration::ZERO);
        }
    }
}
