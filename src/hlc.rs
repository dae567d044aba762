//! Hybrid logical clock.
//!
//! Each vbucket owns one; it stamps every mutation with a 64-bit CAS that
//! is monotonic within the vbucket across restarts. The physical part is
//! the wall clock in microseconds shifted into the top 48 bits; the low 16
//! bits absorb bursts that land inside the same microsecond.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::stats::EngineStats;
use crate::types::Cas;

const LOGICAL_BITS: u32 = 16;

fn wall_clock_cas() -> u64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    micros << LOGICAL_BITS
}

/// Hybrid logical clock producing monotone CAS values.
pub struct HybridLogicalClock {
    max_cas: AtomicU64,
    ahead_threshold_us: u64,
    behind_threshold_us: u64,
}

impl HybridLogicalClock {
    /// Creates a clock seeded from a persisted `max_cas` (zero for a fresh
    /// vbucket) with the configured drift thresholds.
    pub fn new(initial_max_cas: Cas, ahead_threshold_us: u64, behind_threshold_us: u64) -> Self {
        HybridLogicalClock {
            max_cas: AtomicU64::new(initial_max_cas.0),
            ahead_threshold_us,
            behind_threshold_us,
        }
    }

    /// Issues the next CAS: `max(local, wall_clock) + 1` under a CAS loop,
    /// so values are strictly increasing even under contention.
    pub fn next_cas(&self) -> Cas {
        let mut cur = self.max_cas.load(Ordering::Relaxed);
        loop {
            let next = std::cmp::max(cur, wall_clock_cas()) + 1;
            match self
                .max_cas
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return Cas(next),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Folds an incoming CAS (setWithMeta / delWithMeta) into the clock and
    /// records drift against the local wall clock when it exceeds the
    /// configured thresholds.
    pub fn observe_cas(&self, incoming: Cas, stats: &EngineStats) {
        let local = wall_clock_cas();
        let inc_us = incoming.0 >> LOGICAL_BITS;
        let local_us = local >> LOGICAL_BITS;
        if inc_us > local_us && inc_us - local_us > self.ahead_threshold_us {
            stats.inc_hlc_drift_ahead();
        } else if local_us > inc_us && local_us - inc_us > self.behind_threshold_us {
            stats.inc_hlc_drift_behind();
        }
        self.max_cas.fetch_max(incoming.0, Ordering::AcqRel);
    }

    /// Highest CAS issued or observed; persisted in the vbucket state
    /// record so monotonicity survives restart.
    pub fn max_cas(&self) -> Cas {
        Cas(self.max_cas.load(Ordering::Acquire))
    }

    /// Re-seeds the clock at warmup (persisted max-CAS wins over zero).
    pub fn set_max_cas(&self, cas: Cas) {
        self.max_cas.fetch_max(cas.0, Ordering::AcqRel);
    }
}
