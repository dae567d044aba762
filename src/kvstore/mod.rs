//! Interface to the underlying per-vbucket persistent store.
//!
//! The engine only ever talks to this trait: one read/write handle per
//! shard (the flusher is the sole writer) plus reads from the background
//! fetcher. [`file::FileKvStore`] is the bundled implementation; a
//! different on-disk format plugs in behind the same trait.

pub mod file;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::failover::FailoverTable;
use crate::item::Item;
use crate::types::{Cas, DocKey, Seqno, VBucketState, Vbid};

/// Drift thresholds persisted alongside the vbucket state so a restarted
/// node keeps the same conflict-resolution behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftThresholds {
    /// Microseconds of tolerated forward drift.
    pub ahead_us: u64,
    /// Microseconds of tolerated backward drift.
    pub behind_us: u64,
}

/// The per-vbucket state record persisted with every flush batch.
///
/// Legacy records missing the failover table or snapshot fields are
/// accepted: the missing fields default and the failover table is
/// re-seeded with a fresh uuid at warmup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VBucketStateRecord {
    /// Persisted vbucket state.
    pub state: VBucketState,
    /// Open checkpoint id at flush time.
    pub checkpoint_id: u64,
    /// Highest deletion revision seen.
    pub max_deleted_seqno: u64,
    /// Failover lineage; empty in legacy files.
    #[serde(default)]
    pub failover_table: FailoverTable,
    /// Start of the last persisted snapshot.
    #[serde(default)]
    pub snap_start: Seqno,
    /// End of the last persisted snapshot.
    #[serde(default)]
    pub snap_end: Seqno,
    /// Highest CAS issued; seeds the hybrid logical clock at warmup.
    #[serde(default)]
    pub max_cas: Cas,
    /// Highest mutation seqno persisted.
    #[serde(default)]
    pub high_seqno: Seqno,
    /// Highest seqno removed by compaction.
    #[serde(default)]
    pub purge_seqno: Seqno,
    /// Drift thresholds in force when the record was written.
    #[serde(default)]
    pub hlc_drift_thresholds: DriftThresholds,
}

impl VBucketStateRecord {
    /// A fresh record for a vbucket entering `state`.
    pub fn new(state: VBucketState) -> VBucketStateRecord {
        VBucketStateRecord {
            state,
            checkpoint_id: 1,
            max_deleted_seqno: 0,
            failover_table: FailoverTable::default(),
            snap_start: 0,
            snap_end: 0,
            max_cas: Cas::WILDCARD,
            high_seqno: 0,
            purge_seqno: 0,
            hlc_drift_thresholds: DriftThresholds::default(),
        }
    }
}

/// One slot of a multi-key background fetch.
#[derive(Debug)]
pub struct FetchCtx {
    /// Metadata-only fetches skip the value payload.
    pub meta_only: bool,
    /// Filled in by [`KvStore::get_multi`].
    pub outcome: Option<FetchOutcome>,
}

impl FetchCtx {
    /// A pending fetch slot.
    pub fn new(meta_only: bool) -> FetchCtx {
        FetchCtx { meta_only, outcome: None }
    }
}

/// Result of one background-fetch slot.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The store holds this revision (possibly a tombstone).
    Found(Item),
    /// The store has no trace of the key.
    NotFound,
}

/// What a seqno scan should carry per item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueFilter {
    /// Keys and metadata only.
    KeysOnly,
    /// Full values.
    Values,
}

/// Callback verdict for scans.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanContinue {
    /// Keep scanning.
    Continue,
    /// Stop early.
    Stop,
}

/// Parameters for a compaction run.
#[derive(Clone, Copy, Debug)]
pub struct CompactionConfig {
    /// Tombstones with a seqno strictly below this are dropped.
    pub purge_before_seqno: Seqno,
    /// Drop every tombstone regardless of seqno.
    pub drop_deletes: bool,
}

/// Counters reported by a compaction run.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompactionSummary {
    /// Highest seqno removed; zero when nothing was purged.
    pub purged_up_to: Seqno,
    /// Tombstones removed.
    pub tombstones_purged: u64,
}

/// Hooks driven while compaction walks the file.
pub trait CompactionHooks {
    /// A live item whose expiry has passed; the caller is expected to
    /// queue a real deletion through the vbucket.
    fn expired(&mut self, item: Item);
    /// A surviving key, for bloom filter rebuild. `deleted` marks
    /// tombstones that were kept.
    fn bloom_key(&mut self, key: &DocKey, deleted: bool);
}

/// Hooks that ignore everything.
pub struct NoopCompactionHooks;

impl CompactionHooks for NoopCompactionHooks {
    fn expired(&mut self, _item: Item) {}
    fn bloom_key(&mut self, _key: &DocKey, _deleted: bool) {}
}

/// Handle to the persistent store backing a shard's vbuckets.
///
/// Transactions are per-vbucket: `begin`, then `set`/`del`/
/// `snapshot_vbucket`, then `commit` or `rollback`. The flusher is the
/// only writer; reads may run concurrently.
pub trait KvStore: Send + Sync {
    /// Reads the newest revision of a key (tombstones included).
    fn get(&self, vb: Vbid, key: &DocKey) -> Result<Option<Item>>;

    /// Services a batch of background fetches, filling each context's
    /// outcome.
    fn get_multi(&self, vb: Vbid, fetches: &mut FxHashMap<DocKey, FetchCtx>) -> Result<()>;

    /// Opens a write transaction on the vbucket's file.
    fn begin(&self, vb: Vbid) -> Result<()>;

    /// Stages a mutation into the open transaction.
    fn set(&self, item: &Item) -> Result<()>;

    /// Stages a deletion into the open transaction.
    fn del(&self, item: &Item) -> Result<()>;

    /// Stages the vbucket state record into the open transaction (or
    /// persists it immediately when no transaction is open).
    fn snapshot_vbucket(&self, vb: Vbid, record: &VBucketStateRecord) -> Result<()>;

    /// Durably applies the open transaction.
    fn commit(&self, vb: Vbid) -> Result<()>;

    /// Discards the open transaction.
    fn rollback(&self, vb: Vbid) -> Result<()>;

    /// Compacts the vbucket's file under `cfg`, driving `hooks`.
    fn compact_db(
        &self,
        vb: Vbid,
        cfg: &CompactionConfig,
        hooks: &mut dyn CompactionHooks,
    ) -> Result<CompactionSummary>;

    /// Lists every vbucket with a file on disk and its state record.
    fn list_persisted_vbuckets(&self) -> Result<Vec<(Vbid, VBucketStateRecord)>>;

    /// Walks items with `start_seqno <= by_seqno <= end_seqno` in seqno
    /// order.
    fn scan(
        &self,
        vb: Vbid,
        start_seqno: Seqno,
        end_seqno: Seqno,
        filter: ValueFilter,
        cb: &mut dyn FnMut(Item) -> ScanContinue,
    ) -> Result<()>;

    /// Number of live (non-tombstone) items on disk.
    fn get_item_count(&self, vb: Vbid) -> Result<u64>;

    /// Size of the vbucket's file in bytes.
    fn get_db_file_size(&self, vb: Vbid) -> Result<u64>;

    /// Bytes of useful data in the vbucket's file.
    fn get_db_data_size(&self, vb: Vbid) -> Result<u64>;

    /// Removes the vbucket's file entirely.
    fn delete_vbucket(&self, vb: Vbid) -> Result<()>;
}
