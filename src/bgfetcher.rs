//! The background fetcher: one batching disk reader per shard.
//!
//! A frontend call that needs a non-resident value registers its cookie
//! on the vbucket's fetch queue and returns WouldBlock. The fetcher
//! gathers every queued key for a vbucket into one `get_multi`, restores
//! the results into the hash table, and notifies the waiting cookies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::config::Config;
use crate::cookie::CookieJar;
use crate::executor::{TaskOutcome, TaskRunner, MIN_SLEEP_TIME};
use crate::kvstore::{FetchCtx, FetchOutcome, KvStore};
use crate::types::DocKey;
use crate::vbucket::{VBucket, VBucketMap};

/// Batching reader for one shard.
pub struct BgFetcher {
    shard_id: usize,
    vbmap: Arc<VBucketMap>,
    store: Arc<dyn KvStore>,
    config: Arc<Config>,
    jar: Arc<CookieJar>,
    pending: AtomicBool,
}

impl BgFetcher {
    /// Creates the fetcher for `shard_id`.
    pub fn new(
        shard_id: usize,
        vbmap: Arc<VBucketMap>,
        store: Arc<dyn KvStore>,
        config: Arc<Config>,
        jar: Arc<CookieJar>,
    ) -> Arc<BgFetcher> {
        Arc::new(BgFetcher {
            shard_id,
            vbmap,
            store,
            config,
            jar,
            pending: AtomicBool::new(false),
        })
    }

    /// Wraps the fetcher as an executor task.
    pub fn task(self: &Arc<BgFetcher>) -> Box<dyn TaskRunner> {
        Box::new(BgFetcherTask(Arc::clone(self)))
    }

    /// One round: service every vbucket with queued fetches. Returns true
    /// when work remains (a vbucket had to be re-queued).
    fn fetch_round(&self) -> bool {
        self.pending.store(false, Ordering::Release);
        let mut requeued = false;
        for vb in self.vbmap.iter_shard(self.shard_id, self.config.max_num_shards) {
            if !vb.has_pending_bgfetches() {
                continue;
            }
            if vb.is_bucket_creation() {
                // File not on disk yet; try again after the first flush.
                self.pending.store(true, Ordering::Release);
                requeued = true;
                continue;
            }
            self.fetch_vbucket(&vb);
        }
        requeued
    }

    fn fetch_vbucket(&self, vb: &Arc<VBucket>) {
        let jobs = vb.take_bgfetch_jobs();
        if jobs.is_empty() {
            return;
        }
        let started = Instant::now();
        let mut fetches: FxHashMap<DocKey, FetchCtx> = FxHashMap::default();
        for job in &jobs {
            fetches.insert(job.key.clone(), FetchCtx::new(job.meta_only));
        }
        if let Err(err) = self.store.get_multi(vb.id(), &mut fetches) {
            warn!(
                shard = self.shard_id,
                vb = vb.id().0,
                error = %err,
                "bgfetcher.get_multi_failed"
            );
            vb.requeue_bgfetch_jobs(jobs);
            self.pending.store(true, Ordering::Release);
            return;
        }
        let num_jobs = jobs.len();
        for job in jobs {
            let fetched = fetches.remove(&job.key).and_then(|ctx| match ctx.outcome {
                Some(FetchOutcome::Found(item)) => Some(item),
                _ => None,
            });
            let status = vb.complete_bg_fetch(&job.key, fetched, job.meta_only);
            let waited = job.queued_at.elapsed();
            debug!(
                vb = vb.id().0,
                key = %job.key,
                wait_us = waited.as_micros() as u64,
                ?status,
                "bgfetcher.completed"
            );
            for cookie in job.cookies {
                self.jar.notify(cookie, status);
            }
        }
        debug!(
            shard = self.shard_id,
            vb = vb.id().0,
            keys = num_jobs,
            elapsed_us = started.elapsed().as_micros() as u64,
            "bgfetcher.round"
        );
    }
}

struct BgFetcherTask(Arc<BgFetcher>);

impl TaskRunner for BgFetcherTask {
    fn run(&self) -> TaskOutcome {
        let fetcher = &self.0;
        let requeued = fetcher.fetch_round();
        if requeued || fetcher.pending.load(Ordering::Acquire) {
            // Let the flusher create the file before spinning again.
            return TaskOutcome::Snooze(Duration::from_millis(100));
        }
        TaskOutcome::Snooze(fetcher.config.bg_fetch_delay.max(MIN_SLEEP_TIME))
    }

    fn description(&self) -> String {
        format!("item fetcher for shard {}", self.0.shard_id)
    }
}
