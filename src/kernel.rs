//! # Kernel
//!
//! The task state shared between the dispatcher, the tasks themselves, the
//! lock family and interrupt handlers: one delay value per task plus the
//! identity of the task currently being run.
//!
//! ## Delay encoding
//!
//! ```text
//!   0                 Ready       runs on the next dispatch pass
//!   1 ..= INFINITE-1  TimedWait   milliseconds left until Ready
//!   INFINITE          Suspended   only an explicit resume() clears it
//! ```
//!
//! The kernel is meant to live in a `static` so the bus ISR can reach it:
//!
//! ```ignore
//! static KERNEL: Kernel = Kernel::new();
//! ```
//!
//! Every accessor takes a critical section. Operations that are safe from
//! interrupt context ([`resume`](Kernel::resume),
//! [`suspend_task`](Kernel::suspend_task)) only write the delay array; they
//! never run a task.

use core::fmt;

use crate::async_task::Yield;
use crate::config::{INFINITE, MAX_TASKS};
use crate::sync::Shared;
use crate::task::{TaskId, TaskState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Wiring defects detected by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// `delay()`/`suspend()` was called while no task was running.
    NoCurrentTask,
    /// The task handle does not belong to the attached task table.
    InvalidTask,
    /// The task table holds more than `MAX_TASKS` entries.
    TooManyTasks,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NoCurrentTask => f.write_str("no task is currently running"),
            KernelError::InvalidTask => f.write_str("task handle is not in the task table"),
            KernelError::TooManyTasks => write!(f, "task table exceeds {MAX_TASKS} entries"),
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel state
// ---------------------------------------------------------------------------

struct KernelState {
    delays: [u32; MAX_TASKS],
    task_count: usize,
    current: Option<TaskId>,
}

/// Interrupt-shared task state. See the [module docs](self).
pub struct Kernel {
    state: Shared<KernelState>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            state: Shared::new(KernelState {
                delays: [0; MAX_TASKS],
                task_count: 0,
                current: None,
            }),
        }
    }

    /// Size the delay array for a table of `count` tasks, all Ready.
    pub(crate) fn attach(&self, count: usize) -> Result<(), KernelError> {
        if count > MAX_TASKS {
            log::error!("task table has {count} entries, limit is {MAX_TASKS}");
            return Err(KernelError::TooManyTasks);
        }
        self.state.lock(|s| {
            s.task_count = count;
            s.delays = [0; MAX_TASKS];
            s.current = None;
        });
        Ok(())
    }

    /// Mark every task Ready.
    pub(crate) fn reset_delays(&self) {
        self.state.lock(|s| s.delays = [0; MAX_TASKS]);
    }

    /// Number of tasks in the attached table.
    pub fn task_count(&self) -> usize {
        self.state.lock(|s| s.task_count)
    }

    /// Handle for table slot `index`, if it exists.
    pub fn task(&self, index: usize) -> Option<TaskId> {
        (index < self.task_count()).then(|| TaskId(index as u8))
    }

    /// The task whose `begin()`/`run()` is executing, if any.
    pub fn current(&self) -> Option<TaskId> {
        self.state.lock(|s| s.current)
    }

    /// Install `task` as current, returning whatever was current before.
    pub(crate) fn set_current(&self, task: Option<TaskId>) -> Option<TaskId> {
        self.state.lock(|s| core::mem::replace(&mut s.current, task))
    }

    pub fn state(&self, task: TaskId) -> TaskState {
        TaskState::from_delay(self.raw_delay(task.index()))
    }

    pub(crate) fn raw_delay(&self, index: usize) -> u32 {
        self.state.lock(|s| s.delays.get(index).copied().unwrap_or(INFINITE))
    }

    /// Put the current task to sleep for `ms` milliseconds.
    ///
    /// Takes effect when the task returns to the scheduler; `delay(0)` just
    /// keeps it Ready.
    pub fn delay(&self, ms: u32) -> Result<(), KernelError> {
        self.state.lock(|s| match s.current {
            Some(task) => {
                s.delays[task.index()] = ms;
                Ok(())
            }
            None => Err(KernelError::NoCurrentTask),
        })
        .map_err(|e| {
            log::error!("delay({ms}) outside of a task: {e}");
            e
        })
    }

    /// Suspend the current task until something resumes it.
    pub fn suspend(&self) -> Result<(), KernelError> {
        self.delay(INFINITE)
    }

    /// Make `task` Ready after `ms` milliseconds (`0` = next pass), whatever
    /// state it is in. Safe from interrupt context.
    pub fn resume(&self, task: TaskId, ms: u32) -> Result<(), KernelError> {
        self.write_delay(task, ms)
    }

    /// Suspend an arbitrary task. Safe from interrupt context.
    pub fn suspend_task(&self, task: TaskId) -> Result<(), KernelError> {
        self.write_delay(task, INFINITE)
    }

    fn write_delay(&self, task: TaskId, ms: u32) -> Result<(), KernelError> {
        self.state.lock(|s| {
            if task.index() >= s.task_count {
                return Err(KernelError::InvalidTask);
            }
            s.delays[task.index()] = ms;
            Ok(())
        })
        .map_err(|e| {
            log::error!("{task}: {e}");
            e
        })
    }

    /// Count every timed wait down by `elapsed` milliseconds, saturating at
    /// Ready. Suspended tasks are untouched. Returns whether any task is
    /// Ready afterwards.
    pub(crate) fn elapse(&self, elapsed: u32) -> bool {
        self.state.lock(|s| {
            let count = s.task_count;
            let mut any_ready = false;
            for delay in s.delays[..count].iter_mut() {
                if *delay != INFINITE {
                    *delay = delay.saturating_sub(elapsed);
                }
                any_ready |= *delay == 0;
            }
            any_ready
        })
    }

    // -----------------------------------------------------------------------
    // Coroutine suspension points
    // -----------------------------------------------------------------------

    /// Give the other tasks a turn; resume on the next pass.
    pub fn yield_now(&self) -> Yield<'_> {
        Yield::new(self, 0)
    }

    /// Sleep for `ms` milliseconds, resuming right after the `.await`.
    pub fn yield_resume(&self, ms: u32) -> Yield<'_> {
        Yield::new(self, ms)
    }

    /// Suspend until another task or an interrupt resumes this one.
    pub fn yield_suspend(&self) -> Yield<'_> {
        Yield::new(self, INFINITE)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_with(count: usize) -> Kernel {
        let k = Kernel::new();
        k.attach(count).unwrap();
        k
    }

    #[test]
    fn test_attach_limits() {
        let k = Kernel::new();
        assert_eq!(k.attach(MAX_TASKS + 1), Err(KernelError::TooManyTasks));
        assert!(k.attach(MAX_TASKS).is_ok());
        assert_eq!(k.task_count(), MAX_TASKS);
        assert!(k.task(MAX_TASKS - 1).is_some());
        assert!(k.task(MAX_TASKS).is_none());
    }

    #[test]
    fn test_delay_requires_current_task() {
        let k = kernel_with(2);
        assert_eq!(k.delay(10), Err(KernelError::NoCurrentTask));
        assert_eq!(k.suspend(), Err(KernelError::NoCurrentTask));

        let t1 = k.task(1).unwrap();
        k.set_current(Some(t1));
        k.delay(10).unwrap();
        assert_eq!(k.state(t1), TaskState::TimedWait(10));
        k.suspend().unwrap();
        assert_eq!(k.state(t1), TaskState::Suspended);
        k.set_current(None);
    }

    #[test]
    fn test_elapse_saturates_and_skips_suspended() {
        let k = kernel_with(3);
        let (t0, t1, t2) = (k.task(0).unwrap(), k.task(1).unwrap(), k.task(2).unwrap());
        k.resume(t0, 30).unwrap();
        k.resume(t1, 100).unwrap();
        k.suspend_task(t2).unwrap();

        assert!(!k.elapse(20));
        assert_eq!(k.state(t0), TaskState::TimedWait(10));
        assert!(k.elapse(50));
        assert_eq!(k.state(t0), TaskState::Ready);
        assert_eq!(k.state(t1), TaskState::TimedWait(30));
        assert_eq!(k.state(t2), TaskState::Suspended);
    }

    #[test]
    fn test_resume_rejects_foreign_handle() {
        let k = kernel_with(1);
        assert_eq!(k.resume(TaskId(5), 0), Err(KernelError::InvalidTask));
    }
}
