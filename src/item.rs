//! The `Item` record: one key plus its metadata and (optionally) value.
//!
//! Items flow between the hash table, checkpoint entries, flusher batches,
//! and the KV store. The value blob is a [`Bytes`] handle, so an item can
//! sit in a checkpoint and a flusher batch without copying the payload.

use bytes::Bytes;

use crate::error::{EngineError, Result};
use crate::types::{Cas, Datatype, DocKey, RevSeqno, Seqno, Vbid};

/// Cross-datacenter metadata carried by every document revision.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemMeta {
    /// Compare-and-swap token of this revision.
    pub cas: Cas,
    /// Per-key revision counter.
    pub rev_seqno: RevSeqno,
    /// Opaque client flags.
    pub flags: u32,
    /// Absolute expiration time in unix seconds; zero means no expiry.
    pub exptime: u32,
    /// Datatype bitmask; persisted and restored exactly.
    pub datatype: Datatype,
}

impl ItemMeta {
    /// Conflict-resolution comparison: `(rev_seqno, cas, exptime, flags)`
    /// lexicographically, larger wins.
    pub fn wins_over(&self, other: &ItemMeta) -> bool {
        (self.rev_seqno, self.cas, self.exptime, self.flags)
            > (other.rev_seqno, other.cas, other.exptime, other.flags)
    }
}

/// One revision of a document, addressed by vbucket and key.
#[derive(Clone, Debug)]
pub struct Item {
    /// Owning vbucket.
    pub vbid: Vbid,
    /// Document key.
    pub key: DocKey,
    /// Revision metadata.
    pub meta: ItemMeta,
    /// Mutation sequence number within the vbucket; zero until assigned.
    pub by_seqno: Seqno,
    /// Whether this revision is a deletion (tombstone).
    pub deleted: bool,
    /// Value payload; tombstones may carry none.
    pub value: Option<Bytes>,
}

impl Item {
    /// Builds a live item carrying a value.
    pub fn new(vbid: Vbid, key: DocKey, value: impl Into<Bytes>) -> Item {
        Item {
            vbid,
            key,
            meta: ItemMeta::default(),
            by_seqno: 0,
            deleted: false,
            value: Some(value.into()),
        }
    }

    /// Builds a tombstone for the key.
    pub fn deleted(vbid: Vbid, key: DocKey) -> Item {
        Item {
            vbid,
            key,
            meta: ItemMeta::default(),
            by_seqno: 0,
            deleted: true,
            value: None,
        }
    }

    /// Sets the client flags.
    pub fn with_flags(mut self, flags: u32) -> Item {
        self.meta.flags = flags;
        self
    }

    /// Sets the absolute expiry time (unix seconds; zero = none).
    pub fn with_exptime(mut self, exptime: u32) -> Item {
        self.meta.exptime = exptime;
        self
    }

    /// Sets the datatype bitmask.
    pub fn with_datatype(mut self, datatype: Datatype) -> Item {
        self.meta.datatype = datatype;
        self
    }

    /// Sets the full metadata block (setWithMeta / delWithMeta path).
    pub fn with_meta(mut self, meta: ItemMeta) -> Item {
        self.meta = meta;
        self
    }

    /// Value length in bytes (zero when absent).
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    /// True when `exptime` is set and has passed `now` (unix seconds).
    pub fn is_expired_at(&self, now: u32) -> bool {
        self.meta.exptime != 0 && self.meta.exptime <= now
    }

    /// Returns the value with any snappy framing removed, clearing the
    /// SNAPPY bit. Items without the bit pass through untouched.
    pub fn decompressed(mut self) -> Result<Item> {
        if !self.meta.datatype.contains(Datatype::SNAPPY) {
            return Ok(self);
        }
        let raw = match self.value.take() {
            Some(v) => v,
            None => {
                self.meta.datatype = self.meta.datatype.without(Datatype::SNAPPY);
                return Ok(self);
            }
        };
        let inflated = snap::raw::Decoder::new()
            .decompress_vec(&raw)
            .map_err(|e| EngineError::Decompress(e.to_string()))?;
        self.value = Some(Bytes::from(inflated));
        self.meta.datatype = self.meta.datatype.without(Datatype::SNAPPY);
        Ok(self)
    }
}

/// Current unix time in whole seconds, as used for expiry checks.
pub fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
