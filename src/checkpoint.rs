//! Per-vbucket checkpoint log.
//!
//! An ordered sequence of checkpoints, each an ordered run of mutation and
//! deletion entries bracketed by start/end markers. The persistence cursor
//! (and any replication cursor) advances through the log; closed
//! checkpoints behind every cursor are reclaimed. Queued items hold
//! [`bytes::Bytes`] values, so the log shares payloads with the hash table
//! rather than copying them.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::item::Item;
use crate::stats::EngineStats;
use crate::types::{DocKey, Seqno, Vbid};

/// Name of the cursor owned by the flusher. Always registered.
pub const PERSISTENCE_CURSOR: &str = "persistence";

/// Kind of a checkpoint log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOp {
    /// Structural marker opening a checkpoint.
    CheckpointStart,
    /// A live mutation.
    Mutation,
    /// A tombstone.
    Deletion,
    /// Structural marker closing a checkpoint.
    CheckpointEnd,
}

struct Entry {
    op: QueueOp,
    by_seqno: Seqno,
    item: Option<Item>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CheckpointState {
    Open,
    Closed,
}

struct Checkpoint {
    id: u64,
    state: CheckpointState,
    start_seqno: Seqno,
    entries: Vec<Entry>,
    key_index: FxHashMap<DocKey, usize>,
    num_ops: usize,
}

impl Checkpoint {
    fn new(id: u64, start_seqno: Seqno) -> Checkpoint {
        Checkpoint {
            id,
            state: CheckpointState::Open,
            start_seqno,
            entries: vec![Entry { op: QueueOp::CheckpointStart, by_seqno: start_seqno, item: None }],
            key_index: FxHashMap::default(),
            num_ops: 0,
        }
    }

    fn close(&mut self) {
        let end_seqno = self.entries.last().map_or(self.start_seqno, |e| e.by_seqno);
        self.entries.push(Entry { op: QueueOp::CheckpointEnd, by_seqno: end_seqno, item: None });
        self.state = CheckpointState::Closed;
    }

    fn queued_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(|e| e.item.as_ref())
            .map(|i| (i.key.len() + i.value_len()) as u64)
            .sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursor {
    ckpt_id: u64,
    entry_idx: usize,
}

struct Inner {
    checkpoints: VecDeque<Checkpoint>,
    next_id: u64,
    cursors: FxHashMap<String, Cursor>,
}

/// One batch handed to the flusher by
/// [`CheckpointManager::drain_for_persistence`].
pub struct FlushBatch {
    /// Mutations and deletions in log order, already deduplicated within
    /// each checkpoint.
    pub items: Vec<Item>,
    /// Start of the disk snapshot this batch extends.
    pub snap_start: Seqno,
    /// Highest seqno in the batch.
    pub snap_end: Seqno,
    /// Checkpoint id the cursor ended up in.
    pub checkpoint_id: u64,
    /// True when the cursor stopped at the batch cap, not the log tail.
    pub more: bool,
}

/// Ordered log of one vbucket's mutations, consumed by cursors.
pub struct CheckpointManager {
    vbid: Vbid,
    chk_max_items: usize,
    stats: Arc<EngineStats>,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    /// Creates the manager with one open checkpoint starting after
    /// `high_seqno` and the persistence cursor registered at its head.
    pub fn new(
        vbid: Vbid,
        high_seqno: Seqno,
        chk_max_items: usize,
        stats: Arc<EngineStats>,
    ) -> CheckpointManager {
        let first = Checkpoint::new(1, high_seqno + 1);
        let mut cursors = FxHashMap::default();
        cursors.insert(PERSISTENCE_CURSOR.to_string(), Cursor { ckpt_id: 1, entry_idx: 1 });
        CheckpointManager {
            vbid,
            chk_max_items: chk_max_items.max(2),
            stats,
            inner: Mutex::new(Inner { checkpoints: VecDeque::from([first]), next_id: 2, cursors }),
        }
    }

    /// Appends a mutation or deletion. The item must already carry its
    /// `by_seqno`. An older entry for the same key in the open checkpoint
    /// (not yet passed by any cursor within it) is superseded.
    pub fn queue_dirty(&self, item: Item) {
        let op = if item.deleted { QueueOp::Deletion } else { QueueOp::Mutation };
        let bytes = (item.key.len() + item.value_len()) as u64;
        let mut inner = self.inner.lock();
        self.maybe_rotate(&mut inner);
        let (open_id, duplicate) = {
            let open = inner.checkpoints.back().expect("open checkpoint always present");
            (open.id, open.key_index.get(&item.key).copied())
        };

        if let Some(old_idx) = duplicate {
            // Supersede the duplicate only if no cursor inside this
            // checkpoint has consumed it yet.
            let consumed = inner
                .cursors
                .values()
                .any(|c| c.ckpt_id == open_id && c.entry_idx > old_idx);
            if !consumed {
                let open = inner.checkpoints.back_mut().expect("open checkpoint always present");
                let old = open.entries.remove(old_idx);
                if let Some(old_item) = old.item {
                    self.stats
                        .mem_shrink((old_item.key.len() + old_item.value_len()) as u64);
                }
                for idx in open.key_index.values_mut() {
                    if *idx > old_idx {
                        *idx -= 1;
                    }
                }
                open.key_index.remove(&item.key);
                open.num_ops -= 1;
                for cursor in inner.cursors.values_mut() {
                    if cursor.ckpt_id == open_id && cursor.entry_idx > old_idx {
                        cursor.entry_idx -= 1;
                    }
                }
            }
        }

        let open = inner.checkpoints.back_mut().expect("open checkpoint always present");
        let by_seqno = item.by_seqno;
        open.key_index.insert(item.key.clone(), open.entries.len());
        open.entries.push(Entry { op, by_seqno, item: Some(item) });
        open.num_ops += 1;
        self.stats.mem_grow(bytes);
        trace!(vb = self.vbid.0, seqno = by_seqno, ?op, "checkpoint.queued");
    }

    fn maybe_rotate(&self, inner: &mut Inner) {
        let rotate = {
            let open = inner.checkpoints.back().expect("open checkpoint always present");
            open.num_ops >= self.chk_max_items
        };
        if rotate {
            self.rotate(inner);
        }
    }

    fn rotate(&self, inner: &mut Inner) {
        let next_id = inner.next_id;
        inner.next_id += 1;
        let start = {
            let open = inner.checkpoints.back_mut().expect("open checkpoint always present");
            open.close();
            open.entries.last().map_or(open.start_seqno, |e| e.by_seqno) + 1
        };
        inner.checkpoints.push_back(Checkpoint::new(next_id, start));
        trace!(vb = self.vbid.0, id = next_id, "checkpoint.created");
    }

    /// Closes the open checkpoint and starts a fresh one (state changes,
    /// takeovers). Returns the new checkpoint id.
    pub fn create_new_checkpoint(&self) -> u64 {
        let mut inner = self.inner.lock();
        self.rotate(&mut inner);
        inner.next_id - 1
    }

    /// Registers a named cursor at the oldest retained checkpoint.
    pub fn register_cursor(&self, name: &str) {
        let mut inner = self.inner.lock();
        let front = inner.checkpoints.front().expect("open checkpoint always present");
        let cursor = Cursor { ckpt_id: front.id, entry_idx: 1 };
        inner.cursors.insert(name.to_string(), cursor);
    }

    /// Drops a named cursor. The persistence cursor cannot be dropped.
    pub fn remove_cursor(&self, name: &str) {
        if name == PERSISTENCE_CURSOR {
            return;
        }
        self.inner.lock().cursors.remove(name);
    }

    /// Entries (mutations and deletions) not yet consumed by the cursor.
    pub fn items_remaining(&self, name: &str) -> usize {
        let inner = self.inner.lock();
        let Some(cursor) = inner.cursors.get(name) else {
            return 0;
        };
        let mut remaining = 0;
        for ckpt in &inner.checkpoints {
            if ckpt.id < cursor.ckpt_id {
                continue;
            }
            let from = if ckpt.id == cursor.ckpt_id { cursor.entry_idx } else { 0 };
            remaining += ckpt.entries[from.min(ckpt.entries.len())..]
                .iter()
                .filter(|e| matches!(e.op, QueueOp::Mutation | QueueOp::Deletion))
                .count();
        }
        remaining
    }

    /// Drains up to `cap` items for the flusher, advancing the persistence
    /// cursor and reclaiming closed checkpoints behind every cursor.
    pub fn drain_for_persistence(&self, cap: usize) -> FlushBatch {
        let mut inner = self.inner.lock();
        let mut cursor = *inner
            .cursors
            .get(PERSISTENCE_CURSOR)
            .expect("persistence cursor always registered");
        let mut items: Vec<Item> = Vec::new();
        let mut snap_start = None;
        let mut snap_end = 0;
        let mut more = false;

        let ids: Vec<u64> = inner.checkpoints.iter().map(|c| c.id).collect();
        for id in ids {
            if id < cursor.ckpt_id {
                continue;
            }
            let pos = inner
                .checkpoints
                .iter()
                .position(|c| c.id == id)
                .expect("checkpoint id just listed");
            let (entries_len, state, start_seqno) = {
                let c = &inner.checkpoints[pos];
                (c.entries.len(), c.state, c.start_seqno)
            };
            if cursor.ckpt_id != id {
                cursor = Cursor { ckpt_id: id, entry_idx: 1 };
            }
            while cursor.entry_idx < entries_len {
                if items.len() >= cap {
                    more = true;
                    break;
                }
                let entry = &inner.checkpoints[pos].entries[cursor.entry_idx];
                if let Some(item) = &entry.item {
                    if snap_start.is_none() {
                        snap_start = Some(start_seqno);
                    }
                    snap_end = snap_end.max(entry.by_seqno);
                    items.push(item.clone());
                }
                cursor.entry_idx += 1;
            }
            if more || state == CheckpointState::Open {
                break;
            }
        }

        inner.cursors.insert(PERSISTENCE_CURSOR.to_string(), cursor);
        let reclaimed = self.reclaim_closed(&mut inner);
        if reclaimed > 0 {
            self.stats.add_items_rm_from_checkpoints(reclaimed);
        }
        // Batch-level dedup: within one batch the last write wins.
        let mut latest: FxHashMap<DocKey, usize> = FxHashMap::default();
        let mut deduped: Vec<Item> = Vec::with_capacity(items.len());
        for item in items {
            match latest.get(&item.key) {
                Some(&idx) => deduped[idx] = item,
                None => {
                    latest.insert(item.key.clone(), deduped.len());
                    deduped.push(item);
                }
            }
        }
        FlushBatch {
            items: deduped,
            snap_start: snap_start.unwrap_or(0),
            snap_end,
            checkpoint_id: cursor.ckpt_id,
            more,
        }
    }

    fn reclaim_closed(&self, inner: &mut Inner) -> u64 {
        let mut reclaimed = 0u64;
        loop {
            let front = match inner.checkpoints.front() {
                Some(c) if c.state == CheckpointState::Closed => c,
                _ => break,
            };
            let id = front.id;
            if inner.cursors.values().any(|c| c.ckpt_id <= id) {
                break;
            }
            let front = inner.checkpoints.pop_front().expect("front just observed");
            reclaimed += front.num_ops as u64;
            self.stats.mem_shrink(front.queued_bytes());
        }
        reclaimed
    }

    /// Number of retained checkpoints (closed but unreclaimed + open).
    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Id of the open checkpoint.
    pub fn open_checkpoint_id(&self) -> u64 {
        self.inner.lock().checkpoints.back().expect("open checkpoint always present").id
    }
}
