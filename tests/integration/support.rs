#![allow(dead_code)]

//! Shared helpers for the integration suite.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use emberkv::{Bucket, Config, Cookie, CookieSink, NullSink, Status, VBucketState, Vbid};

struct SinkInner {
    delivered: Mutex<HashMap<Cookie, Vec<Status>>>,
    cond: Condvar,
}

/// Records every `notify_io_complete` so tests can wait on resumptions.
pub struct RecordingSink(Arc<SinkInner>);

impl CookieSink for RecordingSink {
    fn notify_io_complete(&self, cookie: Cookie, status: Status) {
        let mut delivered = self.0.delivered.lock();
        delivered.entry(cookie).or_default().push(status);
        self.0.cond.notify_all();
    }
}

/// Test-side view of the recorded notifications.
#[derive(Clone)]
pub struct SinkHandle(Arc<SinkInner>);

impl SinkHandle {
    /// Waits for (and consumes) the next notification for `cookie`.
    pub fn wait_for(&self, cookie: Cookie, timeout: Duration) -> Option<Status> {
        let deadline = Instant::now() + timeout;
        let mut delivered = self.0.delivered.lock();
        loop {
            if let Some(statuses) = delivered.get_mut(&cookie) {
                if !statuses.is_empty() {
                    return Some(statuses.remove(0));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.0.cond.wait_for(&mut delivered, deadline - now);
        }
    }

    /// Notifications delivered so far for `cookie` (without consuming).
    pub fn delivered_count(&self, cookie: Cookie) -> usize {
        self.0.delivered.lock().get(&cookie).map_or(0, |v| v.len())
    }
}

/// A sink/handle pair.
pub fn recording_sink() -> (Box<dyn CookieSink>, SinkHandle) {
    let inner = Arc::new(SinkInner { delivered: Mutex::new(HashMap::new()), cond: Condvar::new() });
    (Box::new(RecordingSink(Arc::clone(&inner))), SinkHandle(inner))
}

/// Small, fast config rooted at `dir`.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::compact();
    config.data_dir = dir.to_path_buf();
    config.pager_sleep_time = Duration::from_millis(250);
    config
}

/// Opens a bucket over `dir` with a recording sink and `vbs` active
/// vbuckets.
pub fn open_bucket(dir: &Path, vbs: u16) -> (Arc<Bucket>, SinkHandle) {
    let (sink, handle) = recording_sink();
    let bucket = Bucket::open(test_config(dir), sink).expect("open bucket");
    for vb in 0..vbs {
        assert_eq!(bucket.set_vbucket_state(Vbid(vb), VBucketState::Active), Status::Success);
    }
    (bucket, handle)
}

/// Opens a bucket with an explicit config (no vbuckets pre-created).
pub fn open_bucket_with(config: Config) -> (Arc<Bucket>, SinkHandle) {
    let (sink, handle) = recording_sink();
    let bucket = Bucket::open(config, sink).expect("open bucket");
    (bucket, handle)
}

/// Opens a bucket that drops notifications (polling-only tests).
pub fn open_quiet_bucket(config: Config) -> Arc<Bucket> {
    Bucket::open(config, Box::new(NullSink)).expect("open bucket")
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// Waits until at least `n` items have been persisted.
pub fn wait_persisted(bucket: &Bucket, n: u64) -> bool {
    wait_until(Duration::from_secs(15), || bucket.stats().total_persisted >= n)
}

/// Waits until the vbucket's persistence watermark reaches `seqno`.
/// Robust against in-checkpoint dedup, which can shrink item counts.
pub fn wait_seqno_persisted(bucket: &Bucket, vb: Vbid, seqno: u64) -> bool {
    wait_until(Duration::from_secs(15), || {
        bucket
            .vbucket(vb)
            .map(|vbucket| vbucket.last_persisted_seqno() >= seqno)
            .unwrap_or(false)
    })
}

/// Waits for warmup to report Done.
pub fn wait_warmed_up(bucket: &Bucket) -> bool {
    wait_until(Duration::from_secs(15), || {
        matches!(bucket.warmup_state(), Some(emberkv::warmup::WarmupState::Done) | None)
            && !bucket.is_degraded()
    })
}
