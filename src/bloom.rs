//! Per-vbucket bloom filter.
//!
//! Under full eviction a miss in the hash table says nothing about the
//! disk image, so every negative lookup would cost a background fetch.
//! The filter short-circuits that: absence here guarantees absence on
//! disk, presence means "probe". Rebuilt during compaction; mutations and
//! deletions insert as they are queued.

use parking_lot::Mutex;
use xxhash_rust::xxh64::xxh64;

use crate::types::DocKey;

const SEED_A: u64 = 0x5362_7261_6d62_6c65;
const SEED_B: u64 = 0x456d_6265_724b_5621;

/// Filter lifecycle; mirrors the vbucket's own lifecycle plus the
/// compaction swap window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomStatus {
    /// Filter intentionally absent (`bfilter_enabled = false`).
    Disabled,
    /// Live and answering queries.
    Enabled,
    /// A replacement filter is being populated by compaction.
    Rebuilding,
}

struct BitSet {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    key_count: u64,
}

impl BitSet {
    fn with_estimates(key_count: usize, fp_prob: f64) -> BitSet {
        let n = key_count.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * fp_prob.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;
        BitSet {
            words: vec![0u64; num_bits.div_ceil(64) as usize],
            num_bits,
            num_hashes,
            key_count: 0,
        }
    }

    fn indexes(&self, key: &DocKey) -> impl Iterator<Item = u64> + '_ {
        let h1 = xxh64(key.as_bytes(), SEED_A);
        let h2 = xxh64(key.as_bytes(), SEED_B) | 1;
        let bits = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }

    fn insert(&mut self, key: &DocKey) {
        let slots: Vec<u64> = self.indexes(key).collect();
        for bit in slots {
            self.words[(bit / 64) as usize] |= 1 << (bit % 64);
        }
        self.key_count += 1;
    }

    fn contains(&self, key: &DocKey) -> bool {
        self.indexes(key)
            .all(|bit| self.words[(bit / 64) as usize] & (1 << (bit % 64)) != 0)
    }
}

struct BloomInner {
    live: Option<BitSet>,
    temp: Option<BitSet>,
}

/// Probabilistic key-presence filter for one vbucket.
pub struct BloomFilter {
    inner: Mutex<BloomInner>,
    fp_prob: f64,
    default_key_count: usize,
}

impl BloomFilter {
    /// Creates a filter sized for `key_count` keys at `fp_prob`, or a
    /// disabled placeholder when `enabled` is false.
    pub fn new(enabled: bool, key_count: usize, fp_prob: f64) -> BloomFilter {
        let live = enabled.then(|| BitSet::with_estimates(key_count, fp_prob));
        BloomFilter {
            inner: Mutex::new(BloomInner { live, temp: None }),
            fp_prob,
            default_key_count: key_count,
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> BloomStatus {
        let inner = self.inner.lock();
        match (&inner.live, &inner.temp) {
            (None, _) => BloomStatus::Disabled,
            (Some(_), Some(_)) => BloomStatus::Rebuilding,
            (Some(_), None) => BloomStatus::Enabled,
        }
    }

    /// Records a key. While a rebuild is in flight the key also lands in
    /// the replacement filter so the swap does not lose live mutations.
    pub fn add(&self, key: &DocKey) {
        let mut inner = self.inner.lock();
        if let Some(temp) = inner.temp.as_mut() {
            temp.insert(key);
        }
        if let Some(live) = inner.live.as_mut() {
            live.insert(key);
        }
    }

    /// Whether the key may exist on disk. `true` means "probe"; `false`
    /// is authoritative absence. A disabled filter always says probe.
    pub fn maybe_contains(&self, key: &DocKey) -> bool {
        let inner = self.inner.lock();
        match &inner.live {
            Some(live) => live.contains(key),
            None => true,
        }
    }

    /// Starts a rebuild sized for `estimated_keys` on-disk keys.
    pub fn begin_rebuild(&self, estimated_keys: usize) {
        let mut inner = self.inner.lock();
        if inner.live.is_none() {
            return;
        }
        inner.temp = Some(BitSet::with_estimates(
            estimated_keys.max(self.default_key_count),
            self.fp_prob,
        ));
    }

    /// Adds a surviving on-disk key to the in-flight rebuild.
    pub fn rebuild_add(&self, key: &DocKey) {
        let mut inner = self.inner.lock();
        if let Some(temp) = inner.temp.as_mut() {
            temp.insert(key);
        }
    }

    /// Promotes the rebuilt filter, discarding the old bit set.
    pub fn complete_rebuild(&self) {
        let mut inner = self.inner.lock();
        if let Some(temp) = inner.temp.take() {
            inner.live = Some(temp);
        }
    }

    /// Drops an in-flight rebuild (compaction failed).
    pub fn abort_rebuild(&self) {
        self.inner.lock().temp = None;
    }

    /// Clears the live filter, e.g. when a vbucket file is deleted.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.live.is_some() {
            inner.live = Some(BitSet::with_estimates(self.default_key_count, self.fp_prob));
        }
        inner.temp = None;
    }

    /// Number of keys inserted since the last rebuild or reset.
    pub fn key_count(&self) -> u64 {
        self.inner.lock().live.as_ref().map_or(0, |b| b.key_count)
    }

    /// Configured false-positive probability.
    pub fn fp_prob(&self) -> f64 {
        self.fp_prob
    }

    /// Size of the live bit set in bits (zero when disabled).
    pub fn num_bits(&self) -> u64 {
        self.inner.lock().live.as_ref().map_or(0, |b| b.num_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> DocKey {
        DocKey::from(format!("bloom-key-{i}").as_bytes())
    }

    #[test]
    fn inserted_keys_are_always_reported() {
        let filter = BloomFilter::new(true, 1000, 0.01);
        for i in 0..1000 {
            filter.add(&key(i));
        }
        for i in 0..1000 {
            assert!(filter.maybe_contains(&key(i)));
        }
        assert_eq!(filter.key_count(), 1000);
    }

    #[test]
    fn false_positive_rate_is_roughly_bounded() {
        let filter = BloomFilter::new(true, 1000, 0.01);
        for i in 0..1000 {
            filter.add(&key(i));
        }
        let fp = (1000..11_000).filter(|i| filter.maybe_contains(&key(*i))).count();
        // 1% nominal; allow generous slack for hash luck.
        assert!(fp < 500, "false positives: {fp}");
    }

    #[test]
    fn rebuild_swaps_out_stale_keys() {
        let filter = BloomFilter::new(true, 100, 0.0001);
        filter.add(&key(1));
        filter.add(&key(2));
        filter.begin_rebuild(100);
        // Only key 1 survives compaction; key 3 mutates mid-rebuild.
        filter.rebuild_add(&key(1));
        filter.add(&key(3));
        filter.complete_rebuild();
        assert!(filter.maybe_contains(&key(1)));
        assert!(filter.maybe_contains(&key(3)));
        assert!(!filter.maybe_contains(&key(2)));
    }

    #[test]
    fn disabled_filter_always_probes() {
        let filter = BloomFilter::new(false, 100, 0.01);
        assert_eq!(filter.status(), BloomStatus::Disabled);
        assert!(filter.maybe_contains(&key(9)));
    }
}
