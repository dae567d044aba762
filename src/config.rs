//! Engine configuration.
//!
//! A plain struct with defaults and a couple of named presets; there is no
//! config-file layer here, the embedding frontend owns that.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::EvictionPolicy;

/// Tunables for a bucket and its background machinery.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the per-vbucket data files and access logs.
    pub data_dir: PathBuf,
    /// Initial number of hash buckets per vbucket hash table.
    pub ht_size: usize,
    /// Number of stripe mutexes per hash table.
    pub ht_locks: usize,
    /// Number of vbuckets the bucket is partitioned into.
    pub max_vbuckets: u16,
    /// Number of shards; vbucket `v` belongs to shard `v % max_num_shards`.
    pub max_num_shards: usize,
    /// Memory quota in bytes.
    pub max_size: u64,
    /// Above this the item pager starts evicting.
    pub mem_high_wat: u64,
    /// The item pager stops once memory falls to this mark.
    pub mem_low_wat: u64,
    /// Value-only or full eviction.
    pub item_eviction_policy: EvictionPolicy,
    /// Whether the expiry pager runs at all.
    pub exp_pager_enabled: bool,
    /// Interval between expiry pager passes.
    pub exp_pager_stime: Duration,
    /// Optional wall-clock hour (0-23) for the first expiry pager run.
    pub exp_pager_initial_run_time: Option<u8>,
    /// File name (under `data_dir`) for per-shard access logs.
    pub alog_path: String,
    /// Optional wall-clock hour (0-23) for the access scanner run.
    pub alog_task_time: Option<u8>,
    /// Interval between access scanner passes.
    pub alog_sleep_time: Duration,
    /// The access scanner only runs when the resident ratio (percent) is
    /// below this; otherwise it records a skip.
    pub alog_resident_ratio_threshold: u8,
    /// Whether per-vbucket bloom filters are maintained.
    pub bfilter_enabled: bool,
    /// Target false-positive probability for bloom filters.
    pub bfilter_fp_prob: f64,
    /// Estimated key count used to size a fresh bloom filter.
    pub bfilter_key_count: usize,
    /// Below this residency percentage, full-eviction compaction rebuilds
    /// the filter from the full on-disk key set.
    pub bfilter_residency_threshold: u8,
    /// Max items drained from a checkpoint into one flusher batch.
    pub compaction_write_queue_cap: usize,
    /// Entries in the open checkpoint before a new one is started.
    pub chk_max_items: usize,
    /// Whether warmup runs at startup when persisted files exist.
    pub warmup_enabled: bool,
    /// Warmup stops loading values after this fraction (percent) of
    /// estimated items is resident.
    pub warmup_min_items_threshold: u8,
    /// Warmup stops loading values after this fraction (percent) of the
    /// memory quota is in use.
    pub warmup_min_memory_threshold: u8,
    /// Artificial delay before a background fetch batch is serviced.
    pub bg_fetch_delay: Duration,
    /// Worker threads for each task type.
    pub max_num_readers: usize,
    /// Writer threads (flushers).
    pub max_num_writers: usize,
    /// Auxiliary I/O threads (warmup, access scanner, expiry pager).
    pub max_num_auxio: usize,
    /// Non-I/O threads (pagers, resizer, defragmenter).
    pub max_num_nonio: usize,
    /// GETL lock duration when the client passes zero.
    pub getl_default_timeout: Duration,
    /// Upper bound on a client-requested GETL lock duration.
    pub getl_max_timeout: Duration,
    /// Incoming CAS ahead of local wall clock by more than this bumps the
    /// ahead-drift counter.
    pub hlc_drift_ahead_threshold_us: u64,
    /// Incoming CAS behind local wall clock by more than this bumps the
    /// behind-drift counter.
    pub hlc_drift_behind_threshold_us: u64,
    /// Percentage of each pager pass aimed at active vbuckets.
    pub pager_active_vb_pcnt: u8,
    /// Interval between item pager wakeups (it also wakes on pressure).
    pub pager_sleep_time: Duration,
    /// Whether the defragmenter task runs.
    pub defragmenter_enabled: bool,
    /// Interval between defragmenter passes.
    pub defragmenter_interval: Duration,
    /// A value blob is re-allocated once it has survived this many passes.
    pub defragmenter_age_threshold: u8,
    /// Interval between hash table resizer passes.
    pub ht_resizer_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            ht_size: 47,
            ht_locks: 11,
            max_vbuckets: 64,
            max_num_shards: 4,
            max_size: 256 * 1024 * 1024,
            mem_high_wat: 218 * 1024 * 1024,
            mem_low_wat: 192 * 1024 * 1024,
            item_eviction_policy: EvictionPolicy::ValueOnly,
            exp_pager_enabled: true,
            exp_pager_stime: Duration::from_secs(3600),
            exp_pager_initial_run_time: None,
            alog_path: "access.log".to_string(),
            alog_task_time: None,
            alog_sleep_time: Duration::from_secs(1440 * 60),
            alog_resident_ratio_threshold: 95,
            bfilter_enabled: true,
            bfilter_fp_prob: 0.01,
            bfilter_key_count: 10_000,
            bfilter_residency_threshold: 10,
            compaction_write_queue_cap: 10_000,
            chk_max_items: 500,
            warmup_enabled: true,
            warmup_min_items_threshold: 100,
            warmup_min_memory_threshold: 100,
            bg_fetch_delay: Duration::from_millis(0),
            max_num_readers: 4,
            max_num_writers: 4,
            max_num_auxio: 2,
            max_num_nonio: 2,
            getl_default_timeout: Duration::from_secs(15),
            getl_max_timeout: Duration::from_secs(30),
            hlc_drift_ahead_threshold_us: 5_000_000,
            hlc_drift_behind_threshold_us: 5_000_000,
            pager_active_vb_pcnt: 40,
            pager_sleep_time: Duration::from_secs(5),
            defragmenter_enabled: true,
            defragmenter_interval: Duration::from_secs(600),
            defragmenter_age_threshold: 10,
            ht_resizer_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Preset for full-eviction buckets: metadata leaves memory too, so
    /// bloom filters stay on to spare disk probes for absent keys.
    pub fn full_eviction() -> Self {
        Self {
            item_eviction_policy: EvictionPolicy::FullEviction,
            bfilter_enabled: true,
            ..Self::default()
        }
    }

    /// Small-footprint preset used by tests and embedded deployments:
    /// tiny tables, small quota, snappy background cadence.
    pub fn compact() -> Self {
        Self {
            ht_size: 7,
            ht_locks: 3,
            max_vbuckets: 4,
            max_num_shards: 2,
            max_size: 16 * 1024 * 1024,
            mem_high_wat: 12 * 1024 * 1024,
            mem_low_wat: 8 * 1024 * 1024,
            chk_max_items: 100,
            pager_sleep_time: Duration::from_millis(250),
            ht_resizer_interval: Duration::from_millis(500),
            defragmenter_interval: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// Shard owning the given vbucket.
    pub fn shard_for(&self, vb: crate::types::Vbid) -> usize {
        vb.0 as usize % self.max_num_shards
    }
}
