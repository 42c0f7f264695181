//! Auto-reset event for "wake me when X happens" waits, typically raised by
//! an interrupt handler.

use core::future::Future;

use super::{check_task, is_waiting, wait_list, ReserveError, WaitList};
use crate::async_task::Acquire;
use crate::kernel::Kernel;
use crate::sync::Shared;
use crate::task::TaskId;

struct SignalState {
    raised: bool,
    waiters: WaitList,
}

/// A latched event. [`raise`](Signal::raise) resumes every waiter; the first
/// one to retry [`wait`](Signal::wait) consumes the event, the others queue
/// again.
pub struct Signal {
    state: Shared<SignalState>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub const fn new() -> Self {
        Self {
            state: Shared::new(SignalState {
                raised: false,
                waiters: wait_list(),
            }),
        }
    }

    /// Consume a pending raise, or queue and suspend `task`.
    pub fn wait(&self, kernel: &Kernel, task: TaskId) -> Result<(), ReserveError> {
        check_task(kernel, task)?;
        self.state.lock(|s| {
            if s.raised {
                s.raised = false;
                return Ok(());
            }
            if !is_waiting(&s.waiters, task) && !s.waiters.add_tail(task) {
                return Err(ReserveError::WaitListFull);
            }
            match kernel.suspend_task(task) {
                Ok(()) => Err(ReserveError::WouldBlock),
                Err(_) => Err(ReserveError::InvalidTask),
            }
        })
    }

    pub fn wait_async<'a>(
        &'a self,
        kernel: &'a Kernel,
    ) -> impl Future<Output = Result<(), ReserveError>> + 'a {
        Acquire::new(kernel, move |task| self.wait(kernel, task))
    }

    /// Latch the event and resume all waiters. Interrupt-safe.
    pub fn raise(&self, kernel: &Kernel) {
        self.state.lock(|s| {
            s.raised = true;
            while let Some(task) = s.waiters.remove_head() {
                let _ = kernel.resume(task, 0);
            }
        })
    }

    pub fn is_raised(&self) -> bool {
        self.state.lock(|s| s.raised)
    }
}
