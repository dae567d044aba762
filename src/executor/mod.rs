//! Cooperative task scheduler.
//!
//! One pool per bucket set, four thread groups (writer, reader, auxio,
//! nonio), each draining its own [`TaskQueue`]. Tasks are owned by the
//! pool and addressed by [`TaskId`]; components keep ids, not task
//! references. Created at bucket initialization and shut down with the
//! last bucket.

mod queue;
mod task;

pub use queue::{TaskQueue, MIN_SLEEP_TIME};
pub use task::{Task, TaskId, TaskOutcome, TaskRunner, TaskState, TaskType};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

/// Options for scheduling one task.
#[derive(Clone, Copy, Debug)]
pub struct TaskOptions {
    /// Lower value runs first among ready tasks of a type.
    pub priority: u8,
    /// Delay before the first execution.
    pub initial_delay: Duration,
    /// Tolerate waking this task after death by re-arming it. Reserved
    /// for the item pager.
    pub allow_dead_rearm: bool,
}

impl Default for TaskOptions {
    fn default() -> Self {
        TaskOptions { priority: 5, initial_delay: Duration::ZERO, allow_dead_rearm: false }
    }
}

/// Fixed-size thread pool statically partitioned by task type.
pub struct ExecutorPool {
    queues: Vec<Arc<TaskQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    tasks: Mutex<FxHashMap<TaskId, Arc<Task>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ExecutorPool {
    /// Creates the pool and spawns `counts[type]` workers per task type.
    pub fn new(num_writers: usize, num_readers: usize, num_auxio: usize, num_nonio: usize) -> Arc<ExecutorPool> {
        let queues: Vec<Arc<TaskQueue>> =
            TaskType::ALL.iter().map(|ty| Arc::new(TaskQueue::new(*ty))).collect();
        let pool = Arc::new(ExecutorPool {
            queues,
            workers: Mutex::new(Vec::new()),
            tasks: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });
        let counts = [num_writers.max(1), num_readers.max(1), num_auxio.max(1), num_nonio.max(1)];
        for ty in TaskType::ALL {
            for i in 0..counts[ty.index()] {
                pool.spawn_worker(ty, i);
            }
        }
        info!(
            writers = counts[0],
            readers = counts[1],
            auxio = counts[2],
            nonio = counts[3],
            "executor.started"
        );
        pool
    }

    fn spawn_worker(self: &Arc<Self>, ty: TaskType, idx: usize) {
        let pool = Arc::clone(self);
        let queue = Arc::clone(&self.queues[ty.index()]);
        let handle = std::thread::Builder::new()
            .name(format!("{}_worker_{idx}", ty.as_str()))
            .spawn(move || pool.worker_loop(&queue))
            .expect("spawn executor worker");
        self.workers.lock().push(handle);
    }

    fn worker_loop(&self, queue: &TaskQueue) {
        while let Some(task) = queue.fetch_next_task() {
            if task.state() == TaskState::Dead {
                self.reap(&task);
                continue;
            }
            task.set_state(TaskState::Running);
            let outcome = task.run();
            if task.state() == TaskState::Dead {
                self.reap(&task);
                continue;
            }
            let woken_mid_run = task.take_wake_request();
            match outcome {
                TaskOutcome::Reschedule => queue.schedule(Arc::clone(&task), Instant::now()),
                TaskOutcome::Snooze(_) if woken_mid_run => {
                    queue.schedule(Arc::clone(&task), Instant::now())
                }
                TaskOutcome::Snooze(d) => {
                    task.set_state(TaskState::Snoozed);
                    queue.schedule(Arc::clone(&task), Instant::now() + d);
                }
                TaskOutcome::Done => {
                    task.set_state(TaskState::Dead);
                    self.reap(&task);
                }
            }
        }
    }

    fn reap(&self, task: &Arc<Task>) {
        self.tasks.lock().remove(&task.id());
        debug!(task = task.id().0, desc = %task.description(), "executor.task.reaped");
    }

    /// Schedules a new task, returning its id.
    pub fn schedule(&self, runner: Box<dyn TaskRunner>, ty: TaskType, opts: TaskOptions) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(Task::new(id, ty, opts.priority, opts.allow_dead_rearm, runner));
        debug!(task = id.0, queue = ty.as_str(), desc = %task.description(), "executor.task.scheduled");
        self.tasks.lock().insert(id, Arc::clone(&task));
        self.queues[ty.index()].schedule(task, Instant::now() + opts.initial_delay);
        id
    }

    /// Makes the task runnable now. Waking a dead task re-arms only the
    /// item pager; for anything else it is an invariant violation and
    /// aborts.
    ///
    /// # Panics
    /// When the task is dead and was not scheduled with
    /// `allow_dead_rearm`.
    pub fn wake(&self, id: TaskId) {
        let Some(task) = self.tasks.lock().get(&id).cloned() else {
            return;
        };
        if task.state() == TaskState::Dead {
            if task.allows_dead_rearm() {
                warn!(task = id.0, "executor.task.dead_rearm");
                task.set_state(TaskState::Running);
            } else {
                panic!("woke dead task {} ({})", id.0, task.description());
            }
        }
        self.queues[task.task_type().index()].wake(&task);
    }

    /// Marks the task dead; the next pop reaps it.
    pub fn cancel(&self, id: TaskId) {
        let Some(task) = self.tasks.lock().get(&id).cloned() else {
            return;
        };
        task.set_state(TaskState::Dead);
        // Move it to the front of the rotation so the reap is prompt.
        self.queues[task.task_type().index()].wake(&task);
    }

    /// Parks the task on its queue's pending list until resumed.
    pub fn suspend(&self, id: TaskId) {
        let Some(task) = self.tasks.lock().get(&id).cloned() else {
            return;
        };
        self.queues[task.task_type().index()].suspend(&task);
    }

    /// Releases a suspended task back into the rotation.
    pub fn resume(&self, id: TaskId) {
        let Some(task) = self.tasks.lock().get(&id).cloned() else {
            return;
        };
        task.set_suspended(false);
        self.queues[task.task_type().index()].wake(&task);
    }

    /// Number of registered (unreaped) tasks.
    pub fn num_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Broadcasts shutdown, discards outstanding tasks, joins workers.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for queue in &self.queues {
            queue.shutdown();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
        self.tasks.lock().clear();
        info!("executor.stopped");
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
