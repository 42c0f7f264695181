//! # Lock Family
//!
//! Arbitration of scarce resources between cooperative tasks and the bus
//! interrupt handler. Every lock follows the same pattern:
//!
//! ```text
//!   reserve(task, amount)
//!     amount > max ───────────────► Err(Unsatisfiable)   never queued
//!     owner/availability check ───► Ok(())               granted now
//!     otherwise ──────────────────► enqueue (FIFO), suspend task,
//!                                   Err(WouldBlock)
//!
//!   release() / make_available()    (interrupt-safe)
//!     hand the lock to the head of the wait queue if it can be satisfied,
//!     resume it through the kernel's delay array, stop there
//! ```
//!
//! Waiters are released strictly in arrival order: a small later request is
//! never served ahead of a larger earlier one.
//!
//! Plain tasks call `reserve` and treat `WouldBlock` as "I am queued and
//! suspended; call again when I run next". The retry succeeds once the task has
//! been handed the lock, and never enqueues it twice. Coroutine tasks
//! `.await` the `reserve_async` variants instead.

use core::fmt;

use crate::config::MAX_TASKS;
use crate::kernel::Kernel;
use crate::queue::Queue;
use crate::task::TaskId;

mod counting;
mod mutex;
mod signal;

pub use counting::{Res2Lock, ResLock};
pub use mutex::{Mutex, ResourceLock};
pub use signal::Signal;

/// Storage slots for a wait list: room for every task, plus the ring's
/// sacrificial slot.
pub(crate) const WAIT_SLOTS: usize = MAX_TASKS + 1;

pub(crate) type WaitList = Queue<TaskId, WAIT_SLOTS>;

pub(crate) const fn wait_list() -> WaitList {
    Queue::new(TaskId(0))
}

/// Why a reservation was not granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveError {
    /// The request exceeds the lock's maximum and can never be granted.
    /// Nothing was queued.
    Unsatisfiable,
    /// The caller has been queued and suspended; it will be resumed when the
    /// lock is handed to it.
    WouldBlock,
    /// The wait list has no room left. Permanent: the lock is shared by more
    /// tasks than it was sized for.
    WaitListFull,
    /// A blocking reserve was awaited with no task running.
    NoCurrentTask,
    /// The task handle does not belong to the kernel's task table, so the
    /// lock could never resume it. Nothing was queued.
    InvalidTask,
}

impl ReserveError {
    /// Whether retrying can ever succeed.
    pub const fn is_permanent(self) -> bool {
        !matches!(self, ReserveError::WouldBlock)
    }
}

impl fmt::Display for ReserveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReserveError::Unsatisfiable => "request exceeds the lock's capacity",
            ReserveError::WouldBlock => "resource busy, caller queued",
            ReserveError::WaitListFull => "wait list is full",
            ReserveError::NoCurrentTask => "no task is currently running",
            ReserveError::InvalidTask => "task is not in the kernel's table",
        })
    }
}

/// Refuse handles the kernel cannot suspend or resume, before they reach a
/// wait list.
pub(crate) fn check_task(kernel: &Kernel, task: TaskId) -> Result<(), ReserveError> {
    if kernel.task(task.index()) == Some(task) {
        Ok(())
    } else {
        log::error!("{task} is not attached to the kernel");
        Err(ReserveError::InvalidTask)
    }
}

/// Whether `task` is anywhere in `list`.
pub(crate) fn is_waiting(list: &WaitList, task: TaskId) -> bool {
    list.iter().any(|t| t == task)
}
