//! # Task Model
//!
//! A task is a unit of cooperative work. It never owns its scheduling state:
//! the kernel keeps one delay value per task table slot, and the task is
//! identified only by that slot index ([`TaskId`]).
//!
//! Plain tasks suspend only by returning from [`Task::run`]. Anything they
//! are "waiting for" has to be remembered in the task's own fields and
//! rechecked on the next call. Tasks that need to suspend in the middle of a
//! call chain are written as [`AsyncTask`](crate::async_task::AsyncTask)s.

use core::fmt;

use crate::config::INFINITE;
use crate::kernel::Kernel;

// ---------------------------------------------------------------------------
// Task identity
// ---------------------------------------------------------------------------

/// Index of a task in the scheduler's table.
///
/// Handed out by [`Scheduler::new`](crate::scheduler::Scheduler::new) in table
/// order and resolved back through the kernel, so tasks and locks never hold
/// pointers to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u8);

impl TaskId {
    /// Slot index in the task table.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Scheduling state of a task, decoded from its delay value.
///
/// ```text
///                 dispatch()
///   ┌──────────┐ ───────────► ┌─────────┐
///   │  Ready   │              │ Running │── suspend() ──► Suspended
///   └──────────┘ ◄─────────── └─────────┘                    │
///        ▲         returns         │                         │
///        │                     delay(ms)                     │
///        │    clock reaches 0      ▼           resume(ms)    │
///        └─────────────────── TimedWait(ms) ◄────────────────┘
/// ```
///
/// `Running` is not a separate state: it is "Ready, and currently being
/// called by the scheduler".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runs on the next dispatch pass.
    Ready,
    /// Runs once this many milliseconds have elapsed.
    TimedWait(u32),
    /// Never runs again until an explicit resume.
    Suspended,
}

impl TaskState {
    /// Decode a raw delay value.
    #[inline]
    pub const fn from_delay(delay: u32) -> Self {
        match delay {
            0 => TaskState::Ready,
            INFINITE => TaskState::Suspended,
            ms => TaskState::TimedWait(ms),
        }
    }

    #[inline]
    pub const fn is_ready(self) -> bool {
        matches!(self, TaskState::Ready)
    }
}

// ---------------------------------------------------------------------------
// Task contract
// ---------------------------------------------------------------------------

/// A cooperative unit of work.
///
/// The scheduler calls [`begin`](Task::begin) once for every task, in table
/// order, before any [`run`](Task::run). While either is executing the task is
/// the kernel's current task, so `kernel.delay()` and `kernel.suspend()`
/// apply to it.
pub trait Task {
    /// One-time initialization.
    fn begin(&mut self, _kernel: &Kernel) {}

    /// One slice of work. Must return promptly; the scheduler cannot preempt.
    fn run(&mut self, kernel: &Kernel);
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
