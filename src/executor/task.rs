//! Task model for the executor pool.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

/// Handle identifying a scheduled task. Queues and components exchange
/// ids, never raw task pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Thread class a task runs on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Disk writers (flushers).
    Writer,
    /// Disk readers (background fetchers).
    Reader,
    /// Auxiliary I/O (warmup, access scanner, expiry pager).
    AuxIo,
    /// CPU-only housekeeping (pagers, resizer, defragmenter).
    NonIo,
}

impl TaskType {
    /// Every task type, in queue order.
    pub const ALL: [TaskType; 4] = [TaskType::Writer, TaskType::Reader, TaskType::AuxIo, TaskType::NonIo];

    /// Queue index for this type.
    pub fn index(self) -> usize {
        match self {
            TaskType::Writer => 0,
            TaskType::Reader => 1,
            TaskType::AuxIo => 2,
            TaskType::NonIo => 3,
        }
    }

    /// Short name used in thread names and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Writer => "writer",
            TaskType::Reader => "reader",
            TaskType::AuxIo => "auxio",
            TaskType::NonIo => "nonio",
        }
    }
}

/// Task lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Schedulable or executing.
    Running,
    /// Waiting for its waketime.
    Snoozed,
    /// Cancelled or finished; reaped at the next queue pop.
    Dead,
}

impl TaskState {
    fn from_u8(v: u8) -> TaskState {
        match v {
            0 => TaskState::Running,
            1 => TaskState::Snoozed,
            _ => TaskState::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            TaskState::Running => 0,
            TaskState::Snoozed => 1,
            TaskState::Dead => 2,
        }
    }
}

/// What a task asks for after one execution slice.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Run again as soon as a worker is free.
    Reschedule,
    /// Sleep for the given duration, then run again.
    Snooze(std::time::Duration),
    /// The task is finished; reap it.
    Done,
}

/// The work a task performs. Implementations snooze by returning
/// [`TaskOutcome::Snooze`] rather than blocking the worker.
pub trait TaskRunner: Send + Sync {
    /// Executes one slice.
    fn run(&self) -> TaskOutcome;

    /// Human-readable description for logs.
    fn description(&self) -> String;
}

/// A scheduled task: shared between the pool's queues and the component
/// that created it (via its [`TaskId`]).
pub struct Task {
    id: TaskId,
    ty: TaskType,
    priority: u8,
    state: AtomicU8,
    waketime: Mutex<Instant>,
    suspended: AtomicBool,
    wake_pending: AtomicBool,
    allow_dead_rearm: bool,
    runner: Box<dyn TaskRunner>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        ty: TaskType,
        priority: u8,
        allow_dead_rearm: bool,
        runner: Box<dyn TaskRunner>,
    ) -> Task {
        Task {
            id,
            ty,
            priority,
            state: AtomicU8::new(TaskState::Running.as_u8()),
            waketime: Mutex::new(Instant::now()),
            suspended: AtomicBool::new(false),
            wake_pending: AtomicBool::new(false),
            allow_dead_rearm,
            runner,
        }
    }

    /// Task id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Queue the task runs on.
    pub fn task_type(&self) -> TaskType {
        self.ty
    }

    /// Scheduling priority; lower runs first among ready tasks.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Whether a dead-state wake may re-arm this task. Reserved for the
    /// item pager; any other dead task being woken is an invariant
    /// violation.
    pub fn allows_dead_rearm(&self) -> bool {
        self.allow_dead_rearm
    }

    /// Earliest instant the task may run.
    pub fn waketime(&self) -> Instant {
        *self.waketime.lock()
    }

    pub(crate) fn set_waketime(&self, at: Instant) {
        *self.waketime.lock() = at;
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, v: bool) {
        self.suspended.store(v, Ordering::Release);
    }

    pub(crate) fn note_wake_request(&self) {
        self.wake_pending.store(true, Ordering::Release);
    }

    pub(crate) fn take_wake_request(&self) -> bool {
        self.wake_pending.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn run(&self) -> TaskOutcome {
        self.runner.run()
    }

    /// Description from the runner.
    pub fn description(&self) -> String {
        self.runner.description()
    }
}
