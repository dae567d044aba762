//! One logical queue per task type, built from three sub-queues.
//!
//! `ready` holds tasks runnable now, `future` holds snoozed tasks, and
//! `pending` holds suspended tasks. Worker threads block on the condvar
//! for at most [`MIN_SLEEP_TIME`] before re-evaluating; wakes and new
//! schedules cut the wait short.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::task::{Task, TaskType};

/// Upper bound on one condvar wait; the coarse scheduling resolution.
pub const MIN_SLEEP_TIME: Duration = Duration::from_secs(2);

#[derive(Default)]
struct SubQueues {
    ready: Vec<(Arc<Task>, u64)>,
    future: Vec<Arc<Task>>,
    pending: Vec<Arc<Task>>,
    seq: u64,
}

impl SubQueues {
    fn remove_everywhere(&mut self, id: super::task::TaskId) -> Option<Arc<Task>> {
        if let Some(i) = self.ready.iter().position(|(t, _)| t.id() == id) {
            return Some(self.ready.remove(i).0);
        }
        if let Some(i) = self.future.iter().position(|t| t.id() == id) {
            return Some(self.future.remove(i));
        }
        if let Some(i) = self.pending.iter().position(|t| t.id() == id) {
            return Some(self.pending.remove(i));
        }
        None
    }

    fn push_ready(&mut self, task: Arc<Task>) {
        let seq = self.seq;
        self.seq += 1;
        self.ready.push((task, seq));
    }
}

/// The typed queue a set of worker threads drains.
pub struct TaskQueue {
    ty: TaskType,
    inner: Mutex<SubQueues>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl TaskQueue {
    /// Creates an empty queue for the given task type.
    pub fn new(ty: TaskType) -> TaskQueue {
        TaskQueue {
            ty,
            inner: Mutex::new(SubQueues::default()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Task type served by this queue.
    pub fn task_type(&self) -> TaskType {
        self.ty
    }

    /// Enqueues a task to run at `at`. Suspended tasks land on the
    /// pending sub-queue instead.
    pub fn schedule(&self, task: Arc<Task>, at: Instant) {
        task.set_waketime(at);
        let mut q = self.inner.lock();
        if task.is_suspended() {
            q.pending.push(task);
        } else if at <= Instant::now() {
            q.push_ready(task);
        } else {
            q.future.push(task);
        }
        drop(q);
        self.cond.notify_one();
    }

    /// Makes a task runnable now. Future and pending entries move to the
    /// ready sub-queue; a task not queued here (it is executing) keeps a
    /// note so the worker reschedules it immediately.
    pub fn wake(&self, task: &Arc<Task>) {
        task.set_waketime(Instant::now());
        let mut q = self.inner.lock();
        match q.remove_everywhere(task.id()) {
            Some(found) => {
                found.set_suspended(false);
                q.push_ready(found);
            }
            None => task.note_wake_request(),
        }
        drop(q);
        self.cond.notify_all();
    }

    /// Moves a queued task onto the pending sub-queue.
    pub fn suspend(&self, task: &Arc<Task>) {
        task.set_suspended(true);
        let mut q = self.inner.lock();
        if let Some(found) = q.remove_everywhere(task.id()) {
            q.pending.push(found);
        }
    }

    /// Broadcasts shutdown; blocked fetches return `None`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Sub-queue sizes `(ready, future, pending)`, for observability.
    pub fn depths(&self) -> (usize, usize, usize) {
        let q = self.inner.lock();
        (q.ready.len(), q.future.len(), q.pending.len())
    }

    /// Fetches the next runnable task, sleeping (bounded by
    /// [`MIN_SLEEP_TIME`]) when nothing is due. Returns `None` only on
    /// shutdown; outstanding tasks are discarded with the queue.
    pub fn fetch_next_task(&self) -> Option<Arc<Task>> {
        let mut q = self.inner.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            let now = Instant::now();

            // Promote everything whose waketime has arrived; if several
            // became ready at once, other sleepers should pick them up.
            let mut moved = 0usize;
            let mut i = 0;
            while i < q.future.len() {
                if q.future[i].waketime() <= now {
                    let task = q.future.remove(i);
                    q.push_ready(task);
                    moved += 1;
                } else {
                    i += 1;
                }
            }
            if moved > 1 {
                self.cond.notify_all();
            }

            // Give one pending task a chance to re-enter the rotation.
            if let Some(i) = q.pending.iter().position(|t| !t.is_suspended()) {
                let task = q.pending.remove(i);
                q.push_ready(task);
            }

            if let Some(best) = Self::pick(&mut q) {
                trace!(queue = self.ty.as_str(), task = best.id().0, "taskqueue.pop");
                return Some(best);
            }

            let wait = q
                .future
                .iter()
                .map(|t| t.waketime())
                .min()
                .map(|wt| wt.saturating_duration_since(now).min(MIN_SLEEP_TIME))
                .unwrap_or(MIN_SLEEP_TIME);
            self.cond.wait_for(&mut q, wait);
        }
    }

    /// Pops the best ready task: dead tasks first (for reaping), then
    /// lowest priority value, FIFO within a priority.
    fn pick(q: &mut SubQueues) -> Option<Arc<Task>> {
        if q.ready.is_empty() {
            return None;
        }
        let mut best = 0usize;
        for i in 1..q.ready.len() {
            let (t, seq) = &q.ready[i];
            let (bt, bseq) = &q.ready[best];
            let dead = t.state() == super::task::TaskState::Dead;
            let best_dead = bt.state() == super::task::TaskState::Dead;
            let better = match (dead, best_dead) {
                (true, false) => true,
                (false, true) => false,
                _ => (t.priority(), *seq) < (bt.priority(), *bseq),
            };
            if better {
                best = i;
            }
        }
        Some(q.ready.remove(best).0)
    }
}
