//! # Scheduler
//!
//! Round-robin dispatcher over a static task table. It never preempts: a
//! task gives the CPU back by returning from `run()` (or, for coroutine
//! tasks, by awaiting a suspension point).
//!
//! ## Dispatch algorithm
//!
//! Each call to [`Scheduler::dispatch`]:
//! 1. **Apply elapsed time**: milliseconds since the previous call are taken
//!    off every timed wait, saturating at Ready. Suspended tasks are immune.
//! 2. **Idle path**: if no task is Ready, return at once without running
//!    anything.
//! 3. **Round-robin walk**: from `next_task` to the end of the table, run
//!    every Ready task once, in table order.
//! 4. **Time slice**: with a non-zero slice, once more than `time_slice_ms`
//!    has passed since step 1 the walk stops and remembers the next
//!    unprocessed index; the following call resumes exactly there. A
//!    completed walk resets `next_task` to 0.
//!
//! Across a sequence of sliced calls every Ready task therefore runs exactly
//! once per round, and none runs twice before the others had their turn.

use crate::kernel::{Kernel, KernelError};
use crate::task::{Task, TaskId};

// ---------------------------------------------------------------------------
// Clock source
// ---------------------------------------------------------------------------

/// Monotonic millisecond clock. Only differences are used, so wrap-around
/// is harmless.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

// ---------------------------------------------------------------------------
// Scheduler struct
// ---------------------------------------------------------------------------

/// The dispatcher. Owns the task table for its lifetime; the per-task state
/// lives in the [`Kernel`] so locks and interrupt handlers can reach it.
pub struct Scheduler<'a, C: Clock> {
    kernel: &'a Kernel,
    clock: C,
    tasks: &'a mut [&'a mut dyn Task],
    /// First table index the next dispatch pass looks at.
    next_task: usize,
    /// Clock reading at the previous dispatch.
    last_dispatch: u32,
}

impl<'a, C: Clock> Scheduler<'a, C> {
    /// Attach `tasks` to `kernel`. Slot `i` of the table becomes task `i`.
    ///
    /// # Errors
    /// [`KernelError::TooManyTasks`] if the table exceeds `MAX_TASKS`.
    pub fn new(
        kernel: &'a Kernel,
        clock: C,
        tasks: &'a mut [&'a mut dyn Task],
    ) -> Result<Self, KernelError> {
        kernel.attach(tasks.len())?;
        let last_dispatch = clock.now_ms();
        Ok(Self {
            kernel,
            clock,
            tasks,
            next_task: 0,
            last_dispatch,
        })
    }

    pub fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Index the next dispatch pass starts from.
    pub fn next_task(&self) -> usize {
        self.next_task
    }

    /// Make every task Ready and call each task's `begin()` once, in table
    /// order.
    pub fn begin(&mut self) {
        self.kernel.reset_delays();
        self.next_task = 0;
        for index in 0..self.tasks.len() {
            let id = TaskId(index as u8);
            let previous = self.kernel.set_current(Some(id));
            self.tasks[index].begin(self.kernel);
            self.kernel.set_current(previous);
        }
        self.last_dispatch = self.clock.now_ms();
        log::info!("scheduler started with {} tasks", self.tasks.len());
    }

    /// Run one dispatch pass (see the [module docs](self)). `time_slice_ms`
    /// of `0` disables slicing.
    ///
    /// Returns the number of tasks that ran; `0` means the system is idle
    /// and the caller may sleep until the next interrupt.
    pub fn dispatch(&mut self, time_slice_ms: u32) -> usize {
        let now = self.clock.now_ms();
        let elapsed = now.wrapping_sub(self.last_dispatch);
        self.last_dispatch = now;

        if !self.kernel.elapse(elapsed) {
            return 0;
        }

        let count = self.tasks.len();
        let mut ran = 0;
        let mut index = self.next_task.min(count);
        while index < count {
            if self.kernel.raw_delay(index) == 0 {
                self.run_task(index);
                ran += 1;

                let spent = self.clock.now_ms().wrapping_sub(now);
                if time_slice_ms > 0 && spent > time_slice_ms && index + 1 < count {
                    log::trace!("time slice used up after task {index} ({spent} ms)");
                    self.next_task = index + 1;
                    return ran;
                }
            }
            index += 1;
        }
        self.next_task = 0;
        ran
    }

    fn run_task(&mut self, index: usize) {
        let id = TaskId(index as u8);
        let previous = self.kernel.set_current(Some(id));
        self.tasks[index].run(self.kernel);
        self.kernel.set_current(previous);
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
