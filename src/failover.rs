//! Failover table.
//!
//! Each vbucket keeps an ordered list of `(vb_uuid, seqno)` entries, newest
//! first. A new entry is pushed whenever the vbucket becomes active and at
//! every restart, so a client reconnecting with a stale uuid can detect the
//! lineage change and roll back to the seqno recorded here.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::Seqno;

/// One lineage entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    /// Random 64-bit lineage identifier.
    pub vb_uuid: u64,
    /// High seqno of the vbucket at the moment the entry was created.
    pub by_seqno: Seqno,
}

/// Ordered list of failover entries, newest first.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
}

const MAX_ENTRIES: usize = 25;

fn fresh_uuid() -> u64 {
    // Zero is reserved as "no uuid" in wire formats.
    loop {
        let uuid: u64 = rand::thread_rng().gen();
        if uuid != 0 {
            return uuid;
        }
    }
}

impl FailoverTable {
    /// Creates a table with a single fresh entry at `high_seqno`.
    pub fn new(high_seqno: Seqno) -> FailoverTable {
        let mut table = FailoverTable::default();
        table.create_entry(high_seqno);
        table
    }

    /// Pushes a new `(fresh uuid, high_seqno)` entry. Entries recorded at a
    /// seqno beyond the new one are pruned first: they describe history
    /// this lineage no longer contains.
    pub fn create_entry(&mut self, high_seqno: Seqno) -> FailoverEntry {
        self.entries.retain(|e| e.by_seqno <= high_seqno);
        let entry = FailoverEntry { vb_uuid: fresh_uuid(), by_seqno: high_seqno };
        self.entries.insert(0, entry);
        self.entries.truncate(MAX_ENTRIES);
        entry
    }

    /// Current lineage entry. Panics only if the table was deserialized
    /// empty, which [`FailoverTable::sanitize`] prevents.
    pub fn latest(&self) -> FailoverEntry {
        self.entries[0]
    }

    /// Latest uuid, the one clients should stream under.
    pub fn latest_uuid(&self) -> u64 {
        self.latest().vb_uuid
    }

    /// Looks up a client's uuid. `None` means unknown lineage (full
    /// rollback); `Some(entry)` gives the seqno the client may keep.
    pub fn find(&self, vb_uuid: u64) -> Option<FailoverEntry> {
        self.entries.iter().copied().find(|e| e.vb_uuid == vb_uuid)
    }

    /// Whether `vb_uuid` still names the live lineage.
    pub fn is_current(&self, vb_uuid: u64) -> bool {
        self.latest().vb_uuid == vb_uuid
    }

    /// For a stale `vb_uuid`, the point a client of that lineage may keep:
    /// the seqno at which the next newer lineage began. `None` when the
    /// uuid is current or unknown to this table.
    pub fn rollback_point(&self, vb_uuid: u64) -> Option<(u64, Seqno)> {
        let idx = self.entries.iter().position(|e| e.vb_uuid == vb_uuid)?;
        if idx == 0 {
            return None;
        }
        Some((vb_uuid, self.entries[idx - 1].by_seqno))
    }

    /// All entries, newest first.
    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Repairs a table read from disk: an empty or zero-uuid table (legacy
    /// file formats) gets a synthesized fresh entry.
    pub fn sanitize(&mut self, high_seqno: Seqno) -> bool {
        if self.entries.is_empty() || self.entries.iter().any(|e| e.vb_uuid == 0) {
            self.entries.retain(|e| e.vb_uuid != 0);
            self.create_entry(high_seqno);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_on_each_takeover() {
        let mut table = FailoverTable::new(0);
        let first = table.latest();
        table.create_entry(10);
        assert_ne!(table.latest().vb_uuid, first.vb_uuid);
        assert_eq!(table.latest().by_seqno, 10);
        assert_eq!(table.entries().len(), 2);
        assert!(table.find(first.vb_uuid).is_some());
    }

    #[test]
    fn stale_uuid_is_found_with_its_seqno() {
        let mut table = FailoverTable::new(0);
        let old = table.latest();
        table.create_entry(42);
        let hit = table.find(old.vb_uuid).unwrap();
        assert_eq!(hit.by_seqno, 0);
        assert!(!table.is_current(old.vb_uuid));
    }

    #[test]
    fn sanitize_fixes_legacy_tables() {
        let mut empty = FailoverTable::default();
        assert!(empty.sanitize(7));
        assert_eq!(empty.latest().by_seqno, 7);
        assert_ne!(empty.latest().vb_uuid, 0);

        let mut ok = FailoverTable::new(3);
        assert!(!ok.sanitize(3));
    }

    #[test]
    fn serde_round_trip() {
        let table = FailoverTable::new(5);
        let json = serde_json::to_string(&table).unwrap();
        let back: FailoverTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back.latest(), table.latest());
    }
}
