//! # Coroutine Tasks
//!
//! An [`AsyncTask`] can suspend anywhere in its call graph and later continue
//! exactly where it stopped. The body is an `async` block; the compiler turns
//! it into a resumable state machine whose frame plays the role of a private
//! stack, and every `.await` on a kernel suspension point is a context switch
//! back to the dispatcher.
//!
//! ## Suspension protocol
//!
//! ```text
//!   task body                      kernel                  scheduler
//!   ─────────                      ──────                  ─────────
//!   k.yield_resume(50).await ──►  delay[me] = 50   ──► poll returns Pending
//!                                                         (task "returned")
//!                                 ... 50 ms elapse ...
//!                                 delay[me] = 0    ──► poll again
//!   continues after .await   ◄───────────────────────────────┘
//! ```
//!
//! Readiness is tracked entirely by the kernel's delay array, so the waker
//! handed to the frame is a no-op: the scheduler re-polls a frame only when
//! its slot is Ready.

use core::future::Future;
use core::mem;
use core::pin::Pin;
use core::ptr;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::kernel::Kernel;
use crate::lock::ReserveError;
use crate::task::{Task, TaskId};

// ---------------------------------------------------------------------------
// Suspension points
// ---------------------------------------------------------------------------

/// Future returned by [`Kernel::yield_now`], [`Kernel::yield_resume`] and
/// [`Kernel::yield_suspend`].
///
/// The first poll records the delay for the current task and returns
/// `Pending`; the next poll (after the scheduler finds the task Ready again)
/// completes.
#[must_use = "suspension points do nothing unless awaited"]
pub struct Yield<'k> {
    kernel: &'k Kernel,
    delay: u32,
    yielded: bool,
}

impl<'k> Yield<'k> {
    pub(crate) fn new(kernel: &'k Kernel, delay: u32) -> Self {
        Self {
            kernel,
            delay,
            yielded: false,
        }
    }
}

impl Future for Yield<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        match self.kernel.delay(self.delay) {
            Ok(()) => {
                self.yielded = true;
                Poll::Pending
            }
            // Not running under the scheduler. Already logged; don't hang.
            Err(_) => Poll::Ready(()),
        }
    }
}

/// A blocking resource request.
///
/// Re-runs `attempt` for the current task on every poll until it stops
/// reporting [`ReserveError::WouldBlock`]. The lock suspends the task when it
/// queues it, so the scheduler only polls again once the lock has handed the
/// task its turn (or something else resumed it, in which case the attempt
/// just suspends it again).
#[must_use = "a reservation does nothing unless awaited"]
pub struct Acquire<'k, F> {
    kernel: &'k Kernel,
    attempt: F,
}

impl<'k, F> Acquire<'k, F> {
    pub(crate) fn new(kernel: &'k Kernel, attempt: F) -> Self {
        Self { kernel, attempt }
    }
}

impl<F, T> Future for Acquire<'_, F>
where
    F: FnMut(TaskId) -> Result<T, ReserveError> + Unpin,
{
    type Output = Result<T, ReserveError>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(task) = self.kernel.current() else {
            log::error!("blocking reserve awaited outside of a task");
            return Poll::Ready(Err(ReserveError::NoCurrentTask));
        };
        match (self.attempt)(task) {
            Err(ReserveError::WouldBlock) => Poll::Pending,
            outcome => Poll::Ready(outcome),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

fn noop_raw_waker() -> RawWaker {
    fn no_op(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
    RawWaker::new(ptr::null(), &VTABLE)
}

fn noop_waker() -> Waker {
    // Safety: every vtable entry ignores the data pointer.
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

/// The private execution context of an [`AsyncTask`]: its pinned coroutine
/// frame plus diagnostics.
pub struct AsyncContext<'a> {
    frame: Pin<&'a mut (dyn Future<Output = ()> + 'a)>,
    frame_size: usize,
    resumptions: u32,
    finished: bool,
}

impl<'a> AsyncContext<'a> {
    pub fn new<F: Future<Output = ()> + 'a>(frame: Pin<&'a mut F>) -> Self {
        Self {
            frame,
            frame_size: mem::size_of::<F>(),
            resumptions: 0,
            finished: false,
        }
    }

    /// Switch into the frame until it suspends or finishes.
    pub fn resume(&mut self) -> Poll<()> {
        if self.finished {
            return Poll::Ready(());
        }
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        self.resumptions = self.resumptions.wrapping_add(1);
        let poll = self.frame.as_mut().poll(&mut cx);
        self.finished = poll.is_ready();
        poll
    }

    /// Bytes reserved for the frame. Fixed at compile time, so this is also
    /// the high-water mark.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// How many times the frame has been entered.
    pub fn resumptions(&self) -> u32 {
        self.resumptions
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

// ---------------------------------------------------------------------------
// AsyncTask
// ---------------------------------------------------------------------------

/// A task whose body is a coroutine.
///
/// ```ignore
/// let body = pin!(async {
///     loop {
///         blink();
///         KERNEL.yield_resume(500).await;
///     }
/// });
/// let mut blinker = AsyncTask::new(body);
/// ```
///
/// A body that runs to completion parks its task (Suspended) for good.
pub struct AsyncTask<'a> {
    context: AsyncContext<'a>,
}

impl<'a> AsyncTask<'a> {
    pub fn new<F: Future<Output = ()> + 'a>(body: Pin<&'a mut F>) -> Self {
        Self {
            context: AsyncContext::new(body),
        }
    }

    pub fn context(&self) -> &AsyncContext<'a> {
        &self.context
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }
}

impl Task for AsyncTask<'_> {
    fn run(&mut self, kernel: &Kernel) {
        if self.context.is_finished() {
            let _ = kernel.suspend();
            return;
        }
        if self.context.resume().is_ready() {
            if let Some(me) = kernel.current() {
                log::warn!("{me}: coroutine body returned, parking task");
            }
            let _ = kernel.suspend();
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
