//! The item pager: frees memory when usage crosses the high water mark.
//!
//! A NonIO task that sweeps vbucket hash tables with the pause-resume
//! visitor, evicting clean, unlocked, sufficiently-aged items until usage
//! falls to the low water mark. Replica and pending vbuckets are swept
//! before actives; each pass ages the NRU of survivors so persistent
//! pressure eventually reaches everything.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::executor::{TaskOutcome, TaskRunner};
use crate::hash_table::{PauseResumeVisitor, Position, StoredValue, VisitControl, MAX_NRU};
use crate::stats::EngineStats;
use crate::types::{VBucketState, Vbid};
use crate::vbucket::VBucketMap;

/// Items inspected per execution slice before yielding the worker.
const CHUNK_BUDGET: usize = 1024;

struct PagingVisitor {
    now: Instant,
    budget: usize,
    visited: usize,
    evicted: usize,
    full_eviction: bool,
    stats: Arc<EngineStats>,
    low_wat: u64,
}

impl PauseResumeVisitor for PagingVisitor {
    fn visit(&mut self, sv: &mut StoredValue) -> VisitControl {
        if self.budget == 0 || self.stats.mem_used() <= self.low_wat {
            return VisitControl::Pause;
        }
        self.budget -= 1;
        self.visited += 1;
        if !sv.eligible_for_eviction(self.full_eviction, self.now) {
            return VisitControl::Keep;
        }
        if sv.nru() >= MAX_NRU {
            self.evicted += 1;
            VisitControl::Eject
        } else {
            sv.age_nru();
            VisitControl::Keep
        }
    }
}

struct PagerPass {
    vb_order: Vec<Vbid>,
    idx: usize,
    pos: Position,
    evicted: usize,
}

/// Memory-reclamation task.
pub struct ItemPager {
    vbmap: Arc<VBucketMap>,
    config: Arc<Config>,
    stats: Arc<EngineStats>,
    pass: Mutex<Option<PagerPass>>,
}

impl ItemPager {
    /// Creates the pager.
    pub fn new(vbmap: Arc<VBucketMap>, config: Arc<Config>, stats: Arc<EngineStats>) -> Arc<ItemPager> {
        Arc::new(ItemPager { vbmap, config, stats, pass: Mutex::new(None) })
    }

    /// Wraps the pager as an executor task.
    pub fn task(self: &Arc<ItemPager>) -> Box<dyn TaskRunner> {
        Box::new(ItemPagerTask(Arc::clone(self)))
    }

    fn begin_pass(&self) -> PagerPass {
        // Replicas and pendings give up memory first; actives follow,
        // capped in practice by the low-water stop condition. The
        // active-percent knob decides how much of the sweep may reach
        // into active vbuckets at all.
        let live = self.vbmap.iter_live();
        let mut others: Vec<Vbid> = live
            .iter()
            .filter(|vb| vb.state() != VBucketState::Active)
            .map(|vb| vb.id())
            .collect();
        let mut actives: Vec<Vbid> = live
            .iter()
            .filter(|vb| vb.state() == VBucketState::Active)
            .map(|vb| vb.id())
            .collect();
        if !others.is_empty() {
            let keep = (actives.len() * self.config.pager_active_vb_pcnt as usize).div_ceil(100);
            actives.truncate(keep);
        }
        others.append(&mut actives);
        self.stats.inc_num_pager_runs();
        info!(
            vbuckets = others.len(),
            mem_used = self.stats.mem_used(),
            high_wat = self.config.mem_high_wat,
            "itempager.pass_begin"
        );
        PagerPass { vb_order: others, idx: 0, pos: Position::begin(), evicted: 0 }
    }

    /// Runs one slice. Returns `(pass_finished, evicted_so_far)`.
    fn run_slice(&self) -> (bool, usize) {
        let mut slot = self.pass.lock();
        let pass = slot.get_or_insert_with(|| self.begin_pass());
        let mut visitor = PagingVisitor {
            now: Instant::now(),
            budget: CHUNK_BUDGET,
            visited: 0,
            evicted: 0,
            full_eviction: matches!(
                self.config.item_eviction_policy,
                crate::types::EvictionPolicy::FullEviction
            ),
            stats: Arc::clone(&self.stats),
            low_wat: self.config.mem_low_wat,
        };
        while pass.idx < pass.vb_order.len() {
            if visitor.budget == 0 || self.stats.mem_used() <= self.config.mem_low_wat {
                break;
            }
            let vbid = pass.vb_order[pass.idx];
            let Some(vb) = self.vbmap.get(vbid) else {
                pass.idx += 1;
                pass.pos = Position::begin();
                continue;
            };
            match vb.ht().pause_resume_visit(&mut visitor, pass.pos) {
                Some(pos) => pass.pos = pos,
                None => {
                    pass.idx += 1;
                    pass.pos = Position::begin();
                }
            }
        }
        pass.evicted += visitor.evicted;
        debug!(
            visited = visitor.visited,
            evicted = visitor.evicted,
            mem_used = self.stats.mem_used(),
            "itempager.slice"
        );
        let finished =
            pass.idx >= pass.vb_order.len() || self.stats.mem_used() <= self.config.mem_low_wat;
        let evicted = pass.evicted;
        if finished {
            *slot = None;
        }
        (finished, evicted)
    }
}

struct ItemPagerTask(Arc<ItemPager>);

impl TaskRunner for ItemPagerTask {
    fn run(&self) -> TaskOutcome {
        let pager = &self.0;
        let mid_pass = pager.pass.lock().is_some();
        if !mid_pass && pager.stats.mem_used() <= pager.config.mem_high_wat {
            return TaskOutcome::Snooze(pager.config.pager_sleep_time);
        }
        let (finished, evicted) = pager.run_slice();
        if !finished {
            return TaskOutcome::Reschedule;
        }
        if pager.stats.mem_used() > pager.config.mem_high_wat && evicted > 0 {
            // Still over the mark but progressing; run another pass now.
            return TaskOutcome::Reschedule;
        }
        TaskOutcome::Snooze(pager.config.pager_sleep_time)
    }

    fn description(&self) -> String {
        "paging out items".to_string()
    }
}
