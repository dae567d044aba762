//! In-memory record of one key, chained into a hash bucket.

use std::time::Instant;

use bytes::Bytes;

use crate::item::{Item, ItemMeta};
use crate::types::{Cas, Datatype, DocKey, RevSeqno, Seqno, Vbid};

/// Highest not-recently-used value; items age toward this and are evicted
/// once they reach it.
pub const MAX_NRU: u8 = 3;

/// NRU assigned to freshly stored items: old enough to be evictable after
/// a couple of pager passes, young enough to survive the first.
pub const INITIAL_NRU: u8 = 2;

/// Lifecycle of a temporary item created to carry a background fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempState {
    /// The fetch has been queued; no answer yet.
    Fetching,
    /// The store had no trace of the key.
    NonExistent,
    /// Metadata (possibly of a tombstone) has been restored.
    Complete,
}

/// One key's in-memory record.
pub struct StoredValue {
    key: DocKey,
    cas: Cas,
    rev_seqno: RevSeqno,
    by_seqno: Seqno,
    flags: u32,
    exptime: u32,
    datatype: Datatype,
    lock_expiry: Option<Instant>,
    dirty: bool,
    deleted: bool,
    resident: bool,
    temp: Option<TempState>,
    nru: u8,
    blob_age: u8,
    value: Option<Bytes>,
    next: Option<Box<StoredValue>>,
}

/// Fixed per-record overhead charged to the memory gauge, covering the
/// struct itself and its chain link.
const BASE_OVERHEAD: usize = 120;

impl StoredValue {
    /// Builds a record from an item. The caller decides dirtiness.
    pub fn from_item(item: &Item, dirty: bool) -> StoredValue {
        StoredValue {
            key: item.key.clone(),
            cas: item.meta.cas,
            rev_seqno: item.meta.rev_seqno,
            by_seqno: item.by_seqno,
            flags: item.meta.flags,
            exptime: item.meta.exptime,
            datatype: item.meta.datatype,
            lock_expiry: None,
            dirty,
            deleted: item.deleted,
            resident: item.value.is_some(),
            temp: None,
            nru: INITIAL_NRU,
            blob_age: 0,
            value: item.value.clone(),
            next: None,
        }
    }

    /// Builds a temporary record awaiting a background fetch.
    pub fn temp(key: DocKey) -> StoredValue {
        StoredValue {
            key,
            cas: Cas::WILDCARD,
            rev_seqno: 0,
            by_seqno: 0,
            flags: 0,
            exptime: 0,
            datatype: Datatype::RAW,
            lock_expiry: None,
            dirty: false,
            deleted: false,
            resident: false,
            temp: Some(TempState::Fetching),
            nru: MAX_NRU,
            blob_age: 0,
            value: None,
            next: None,
        }
    }

    /// Document key.
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// Stored CAS, ignoring any lock.
    pub fn cas(&self) -> Cas {
        self.cas
    }

    /// CAS as shown to ordinary reads: the lock sentinel while locked.
    /// Replication producers must never see the sentinel; they read
    /// [`StoredValue::cas`] instead.
    pub fn visible_cas(&self, now: Instant) -> Cas {
        if self.is_locked(now) {
            Cas::LOCKED
        } else {
            self.cas
        }
    }

    /// Per-key revision counter.
    pub fn rev_seqno(&self) -> RevSeqno {
        self.rev_seqno
    }

    /// Mutation seqno of the current revision.
    pub fn by_seqno(&self) -> Seqno {
        self.by_seqno
    }

    /// Client flags.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Absolute expiry in unix seconds (zero = none).
    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    /// Datatype bitmask.
    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Current metadata block.
    pub fn meta(&self) -> ItemMeta {
        ItemMeta {
            cas: self.cas,
            rev_seqno: self.rev_seqno,
            flags: self.flags,
            exptime: self.exptime,
            datatype: self.datatype,
        }
    }

    /// Whether this revision awaits persistence.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clears the dirty flag once the revision is on disk.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Marks the record dirty (a new revision was just stored).
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether this is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether the value blob is in memory.
    pub fn is_resident(&self) -> bool {
        self.resident
    }

    /// Whether this is a temporary record for a background fetch.
    pub fn is_temp(&self) -> bool {
        self.temp.is_some()
    }

    /// Temp lifecycle state, if any.
    pub fn temp_state(&self) -> Option<TempState> {
        self.temp
    }

    /// Marks a temp record as "nothing on disk".
    pub fn set_temp_non_existent(&mut self) {
        self.temp = Some(TempState::NonExistent);
    }

    /// Whether a GETL lock is in force at `now`.
    pub fn is_locked(&self, now: Instant) -> bool {
        match self.lock_expiry {
            Some(until) => until > now,
            None => false,
        }
    }

    /// Places a GETL lock until the given deadline.
    pub fn lock_until(&mut self, until: Instant) {
        self.lock_expiry = Some(until);
    }

    /// Releases any GETL lock.
    pub fn unlock(&mut self) {
        self.lock_expiry = None;
    }

    /// NRU age (0 = recently used).
    pub fn nru(&self) -> u8 {
        self.nru
    }

    /// Notes an access: the item becomes recently used.
    pub fn set_referenced(&mut self) {
        self.nru = 0;
    }

    /// Ages the item one pager round, saturating at [`MAX_NRU`].
    pub fn age_nru(&mut self) {
        self.nru = (self.nru + 1).min(MAX_NRU);
    }

    /// Pager rounds the value blob has survived without reallocation.
    pub fn blob_age(&self) -> u8 {
        self.blob_age
    }

    /// Ages the value blob one defragmenter round.
    pub fn age_blob(&mut self) {
        self.blob_age = self.blob_age.saturating_add(1);
    }

    /// Copies the value into a fresh allocation, resetting its age.
    /// Returns false when there is nothing to move.
    pub fn realloc_value(&mut self) -> bool {
        match self.value.take() {
            Some(v) => {
                self.value = Some(Bytes::from(v.to_vec()));
                self.blob_age = 0;
                true
            }
            None => false,
        }
    }

    /// Value blob, if resident.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    /// Whether the expiry has passed `now` (unix seconds). Temp records
    /// and tombstones never expire again.
    pub fn is_expired_at(&self, now: u32) -> bool {
        !self.is_temp() && !self.deleted && self.exptime != 0 && self.exptime <= now
    }

    /// Applies a new revision. Clears temp status: the record now holds
    /// real data.
    pub fn apply_item(&mut self, item: &Item, dirty: bool) {
        self.cas = item.meta.cas;
        self.rev_seqno = item.meta.rev_seqno;
        self.by_seqno = item.by_seqno;
        self.flags = item.meta.flags;
        self.exptime = item.meta.exptime;
        self.datatype = item.meta.datatype;
        self.deleted = item.deleted;
        self.value = item.value.clone();
        self.resident = item.value.is_some() || item.deleted;
        self.temp = None;
        self.dirty = dirty;
        self.lock_expiry = None;
        self.blob_age = 0;
    }

    /// Drops the value blob, leaving metadata behind (value eviction).
    pub fn eject_value(&mut self) {
        self.value = None;
        self.resident = false;
    }

    /// Restores a fetched value into a non-resident record. Metadata is
    /// left alone: the disk copy can only be the same revision or older,
    /// and in-memory metadata is authoritative.
    pub fn restore_value(&mut self, item: &Item) {
        self.value = item.value.clone();
        self.resident = true;
        self.temp = None;
        self.nru = INITIAL_NRU;
    }

    /// Restores fetched metadata into a temp record.
    pub fn restore_meta(&mut self, item: &Item) {
        self.cas = item.meta.cas;
        self.rev_seqno = item.meta.rev_seqno;
        self.flags = item.meta.flags;
        self.exptime = item.meta.exptime;
        self.datatype = item.meta.datatype;
        self.by_seqno = item.by_seqno;
        self.deleted = item.deleted;
        self.temp = Some(TempState::Complete);
    }

    /// Whether the pager may take this item's memory under the given
    /// policy. Dirty and locked items are never eligible.
    pub fn eligible_for_eviction(&self, full_eviction: bool, now: Instant) -> bool {
        if self.dirty || self.is_locked(now) || self.is_temp() || self.deleted {
            return false;
        }
        if full_eviction {
            true
        } else {
            self.resident && self.value.is_some()
        }
    }

    /// Materializes the record as an item.
    pub fn to_item(&self, vbid: Vbid) -> Item {
        Item {
            vbid,
            key: self.key.clone(),
            meta: self.meta(),
            by_seqno: self.by_seqno,
            deleted: self.deleted,
            value: self.value.clone(),
        }
    }

    /// Bytes charged to the memory gauge for this record.
    pub fn mem_size(&self) -> usize {
        BASE_OVERHEAD + self.key.len() + self.value.as_ref().map_or(0, |v| v.len())
    }

    /// Next record in the chain (read side).
    pub fn next(&self) -> Option<&StoredValue> {
        self.next.as_deref()
    }

    pub(crate) fn next_slot(&mut self) -> &mut Option<Box<StoredValue>> {
        &mut self.next
    }

    pub(crate) fn take_next(&mut self) -> Option<Box<StoredValue>> {
        self.next.take()
    }

    pub(crate) fn set_next(&mut self, next: Option<Box<StoredValue>>) {
        self.next = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn item(key: &str, value: &str) -> Item {
        Item::new(Vbid(0), DocKey::from(key), value.as_bytes().to_vec())
    }

    #[test]
    fn lock_expires_on_its_own() {
        let mut sv = StoredValue::from_item(&item("k", "v"), true);
        let now = Instant::now();
        sv.lock_until(now + Duration::from_millis(50));
        assert!(sv.is_locked(now));
        assert_eq!(sv.visible_cas(now), Cas::LOCKED);
        let later = now + Duration::from_millis(51);
        assert!(!sv.is_locked(later));
        assert_eq!(sv.visible_cas(later), sv.cas());
    }

    #[test]
    fn ejection_eligibility() {
        let now = Instant::now();
        let mut sv = StoredValue::from_item(&item("k", "v"), true);
        assert!(!sv.eligible_for_eviction(false, now), "dirty");
        sv.mark_clean();
        assert!(sv.eligible_for_eviction(false, now));
        sv.eject_value();
        assert!(!sv.eligible_for_eviction(false, now), "already gone");
        assert!(sv.eligible_for_eviction(true, now), "full eviction may unlink");
    }

    #[test]
    fn temp_lifecycle() {
        let mut sv = StoredValue::temp(DocKey::from("k"));
        assert_eq!(sv.temp_state(), Some(TempState::Fetching));
        let mut found = item("k", "v");
        found.meta.rev_seqno = 4;
        sv.restore_meta(&found);
        assert_eq!(sv.temp_state(), Some(TempState::Complete));
        assert_eq!(sv.rev_seqno(), 4);
        assert!(!sv.is_resident());
    }

    #[test]
    fn nru_ages_and_resets() {
        let mut sv = StoredValue::from_item(&item("k", "v"), false);
        assert_eq!(sv.nru(), INITIAL_NRU);
        sv.age_nru();
        sv.age_nru();
        assert_eq!(sv.nru(), MAX_NRU);
        sv.set_referenced();
        assert_eq!(sv.nru(), 0);
    }
}
