//! Counting locks over one ([`ResLock`]) or two ([`Res2Lock`]) independent
//! counters.
//!
//! Reservation and consumption are separate steps:
//!
//! ```text
//!   reserve(task, n)      → granted at once when nobody is owner or queued
//!                           and n fits; nothing is deducted yet
//!   use_available(n)      → deduct what was actually taken
//!   make_available(n)     → return units (interrupt-safe); a queue head that
//!                           now fits is popped, made owner and resumed
//!   release(task)         → the owner gives up its turn; the next
//!                           satisfiable waiter becomes owner
//! ```
//!
//! Only a task handed the lock from the wait queue becomes owner. An
//! immediate grant takes no ownership, so units returned by
//! `make_available` alone are enough to drain the queue.
//!
//! `0 <= available <= max` holds for every counter at all times.

use core::future::Future;

use super::{check_task, ReserveError, WAIT_SLOTS};
use crate::async_task::Acquire;
use crate::kernel::Kernel;
use crate::queue::Queue;
use crate::sync::Shared;
use crate::task::TaskId;

// ---------------------------------------------------------------------------
// Shared algorithm
// ---------------------------------------------------------------------------

struct Counters<const D: usize> {
    max: [u16; D],
    available: [u16; D],
    owner: Option<TaskId>,
    waiters: Queue<(TaskId, [u16; D]), WAIT_SLOTS>,
}

impl<const D: usize> Counters<D> {
    const fn new(max: [u16; D]) -> Self {
        Self {
            max,
            available: max,
            owner: None,
            waiters: Queue::new((TaskId(0), [0; D])),
        }
    }

    fn exceeds_max(&self, amount: &[u16; D]) -> bool {
        amount.iter().zip(self.max.iter()).any(|(a, m)| a > m)
    }

    fn fits(&self, amount: &[u16; D]) -> bool {
        amount.iter().zip(self.available.iter()).all(|(a, v)| a <= v)
    }

    fn reserve(&mut self, kernel: &Kernel, task: TaskId, amount: [u16; D]) -> Result<(), ReserveError> {
        if self.exceeds_max(&amount) {
            log::debug!("{task}: request {amount:?} exceeds max {:?}", self.max);
            return Err(ReserveError::Unsatisfiable);
        }
        if self.owner == Some(task) {
            return Ok(());
        }
        check_task(kernel, task)?;
        if self.owner.is_none() && self.waiters.is_empty() && self.fits(&amount) {
            log::trace!("{task}: granted {amount:?}, available {:?}", self.available);
            return Ok(());
        }
        if !self.waiters.iter().any(|(t, _)| t == task) {
            if !self.waiters.add_tail((task, amount)) {
                return Err(ReserveError::WaitListFull);
            }
            log::trace!("{task}: queued for {amount:?}");
        }
        if kernel.suspend_task(task).is_err() {
            return Err(ReserveError::InvalidTask);
        }
        Err(ReserveError::WouldBlock)
    }

    fn use_available(&mut self, amount: [u16; D]) -> bool {
        if !self.fits(&amount) {
            return false;
        }
        for (v, a) in self.available.iter_mut().zip(amount.iter()) {
            *v -= a;
        }
        true
    }

    fn make_available(&mut self, kernel: &Kernel, amount: [u16; D]) {
        for ((v, a), m) in self.available.iter_mut().zip(amount.iter()).zip(self.max.iter()) {
            *v = v.saturating_add(*a).min(*m);
        }
        self.hand_off(kernel);
    }

    fn release(&mut self, kernel: &Kernel, task: TaskId) {
        match self.owner {
            Some(owner) if owner == task => self.owner = None,
            Some(owner) => {
                log::warn!("{task}: release while {owner} owns the lock");
                return;
            }
            None => {}
        }
        self.hand_off(kernel);
    }

    /// Promote the queue head to owner if nobody owns the lock and the head's
    /// request fits. Never looks past the head.
    fn hand_off(&mut self, kernel: &Kernel) {
        if self.owner.is_some() {
            return;
        }
        let Some((task, amount)) = self.waiters.peek_head(0) else {
            return;
        };
        if self.fits(&amount) {
            self.waiters.remove_head();
            self.owner = Some(task);
            log::trace!("{task}: handed {amount:?}, available {:?}", self.available);
            let _ = kernel.resume(task, 0);
        }
    }
}

// ---------------------------------------------------------------------------
// ResLock
// ---------------------------------------------------------------------------

/// One-dimensional counting semaphore with FIFO waiters.
pub struct ResLock {
    state: Shared<Counters<1>>,
}

impl ResLock {
    /// A lock with `max` units, all available.
    pub const fn new(max: u16) -> Self {
        Self {
            state: Shared::new(Counters::new([max])),
        }
    }

    /// Ask for a turn to take `amount` units.
    pub fn reserve(&self, kernel: &Kernel, task: TaskId, amount: u16) -> Result<(), ReserveError> {
        self.state.lock(|s| s.reserve(kernel, task, [amount]))
    }

    pub fn reserve_async<'a>(
        &'a self,
        kernel: &'a Kernel,
        amount: u16,
    ) -> impl Future<Output = Result<(), ReserveError>> + 'a {
        Acquire::new(kernel, move |task| self.reserve(kernel, task, amount))
    }

    /// Deduct `amount` units. Returns `false`, deducting nothing, if fewer are
    /// available.
    pub fn use_available(&self, amount: u16) -> bool {
        self.state.lock(|s| s.use_available([amount]))
    }

    /// Return `amount` units (capped at `max`). Interrupt-safe.
    pub fn make_available(&self, kernel: &Kernel, amount: u16) {
        self.state.lock(|s| s.make_available(kernel, [amount]))
    }

    /// End `task`'s turn. Only a task that was handed the lock from the wait
    /// queue owns it; for an immediately granted task this just retries the
    /// hand-off. Interrupt-safe.
    pub fn release(&self, kernel: &Kernel, task: TaskId) {
        self.state.lock(|s| s.release(kernel, task))
    }

    pub fn available(&self) -> u16 {
        self.state.lock(|s| s.available[0])
    }

    pub fn max(&self) -> u16 {
        self.state.lock(|s| s.max[0])
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock(|s| s.owner)
    }

    pub fn waiting(&self) -> usize {
        self.state.lock(|s| s.waiters.count())
    }
}

// ---------------------------------------------------------------------------
// Res2Lock
// ---------------------------------------------------------------------------

/// Two-dimensional counting semaphore: a request is satisfied only when both
/// counters cover it at once.
pub struct Res2Lock {
    state: Shared<Counters<2>>,
}

impl Res2Lock {
    pub const fn new(max1: u16, max2: u16) -> Self {
        Self {
            state: Shared::new(Counters::new([max1, max2])),
        }
    }

    pub fn reserve(
        &self,
        kernel: &Kernel,
        task: TaskId,
        amount1: u16,
        amount2: u16,
    ) -> Result<(), ReserveError> {
        self.state.lock(|s| s.reserve(kernel, task, [amount1, amount2]))
    }

    pub fn reserve_async<'a>(
        &'a self,
        kernel: &'a Kernel,
        amount1: u16,
        amount2: u16,
    ) -> impl Future<Output = Result<(), ReserveError>> + 'a {
        Acquire::new(kernel, move |task| self.reserve(kernel, task, amount1, amount2))
    }

    pub fn use_available(&self, amount1: u16, amount2: u16) -> bool {
        self.state.lock(|s| s.use_available([amount1, amount2]))
    }

    pub fn make_available(&self, kernel: &Kernel, amount1: u16, amount2: u16) {
        self.state.lock(|s| s.make_available(kernel, [amount1, amount2]))
    }

    /// End `task`'s turn. Only a task that was handed the lock from the wait
    /// queue owns it; for an immediately granted task this just retries the
    /// hand-off. Interrupt-safe.
    pub fn release(&self, kernel: &Kernel, task: TaskId) {
        self.state.lock(|s| s.release(kernel, task))
    }

    pub fn available(&self) -> (u16, u16) {
        self.state.lock(|s| (s.available[0], s.available[1]))
    }

    pub fn max(&self) -> (u16, u16) {
        self.state.lock(|s| (s.max[0], s.max[1]))
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock(|s| s.owner)
    }

    pub fn waiting(&self) -> usize {
        self.state.lock(|s| s.waiters.count())
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    fn kernel_with(count: usize) -> Kernel {
        let _ = env_logger::builder().is_test(true).try_init();
        let k = Kernel::new();
        k.attach(count).unwrap();
        k
    }

    #[test]
    fn test_unsatisfiable_is_never_queued() {
        let k = kernel_with(1);
        let a = k.task(0).unwrap();
        let lock = ResLock::new(3);
        assert_eq!(lock.reserve(&k, a, 4), Err(ReserveError::Unsatisfiable));
        assert_eq!(lock.waiting(), 0);
        assert_eq!(lock.owner(), None);
        assert_eq!(k.state(a), TaskState::Ready);
        assert!(ReserveError::Unsatisfiable.is_permanent());
        assert!(!ReserveError::WouldBlock.is_permanent());
    }

    #[test]
    fn test_waiter_released_by_make_available_alone() {
        let k = kernel_with(2);
        let (a, b) = (k.task(0).unwrap(), k.task(1).unwrap());
        let lock = ResLock::new(3);

        // A is granted at once and consumes; it never calls release.
        assert_eq!(lock.reserve(&k, a, 3), Ok(()));
        assert_eq!(lock.owner(), None);
        assert!(lock.use_available(3));
        assert!(!lock.use_available(1));
        assert_eq!(lock.available(), 0);

        // B needs two and waits for both units to come back.
        assert_eq!(lock.reserve(&k, b, 2), Err(ReserveError::WouldBlock));
        assert_eq!(k.state(b), TaskState::Suspended);
        lock.make_available(&k, 1);
        assert_eq!(lock.available(), 1);
        assert_eq!(lock.owner(), None);
        assert_eq!(k.state(b), TaskState::Suspended);
        lock.make_available(&k, 1);
        assert_eq!(lock.available(), 2);
        assert_eq!(lock.owner(), Some(b));
        assert_eq!(k.state(b), TaskState::Ready);
        assert_eq!(lock.waiting(), 0);
        assert_eq!(lock.reserve(&k, b, 2), Ok(()));
    }

    #[test]
    fn test_fifo_is_not_reordered_for_smaller_requests() {
        let k = kernel_with(4);
        let t: Vec<_> = (0..4).map(|i| k.task(i).unwrap()).collect();
        let lock = ResLock::new(5);

        assert_eq!(lock.reserve(&k, t[0], 5), Ok(()));
        assert!(lock.use_available(5));
        assert_eq!(lock.reserve(&k, t[1], 2), Err(ReserveError::WouldBlock));
        assert_eq!(lock.reserve(&k, t[2], 4), Err(ReserveError::WouldBlock));
        assert_eq!(lock.reserve(&k, t[3], 1), Err(ReserveError::WouldBlock));

        lock.make_available(&k, 3);
        assert_eq!(lock.owner(), Some(t[1]));
        assert!(lock.use_available(2));
        lock.release(&k, t[1]);

        // One unit left: t[2] needs four, and t[3] (needs one) must not jump it.
        assert_eq!(lock.available(), 1);
        assert_eq!(lock.owner(), None);
        assert_eq!(k.state(t[2]), TaskState::Suspended);
        assert_eq!(k.state(t[3]), TaskState::Suspended);

        lock.make_available(&k, 3);
        assert_eq!(lock.owner(), Some(t[2]));
        assert_eq!(lock.waiting(), 1);
    }

    #[test]
    fn test_newcomer_does_not_barge_past_waiters() {
        let k = kernel_with(3);
        let (a, b, c) = (k.task(0).unwrap(), k.task(1).unwrap(), k.task(2).unwrap());
        let lock = ResLock::new(4);

        assert_eq!(lock.reserve(&k, a, 4), Ok(()));
        assert!(lock.use_available(3));
        assert_eq!(lock.reserve(&k, b, 3), Err(ReserveError::WouldBlock));
        // One unit is free and nobody owns the lock, but b is waiting.
        assert_eq!(lock.reserve(&k, c, 1), Err(ReserveError::WouldBlock));
        assert_eq!(lock.waiting(), 2);
    }

    #[test]
    fn test_only_the_owner_gives_up_its_turn() {
        let k = kernel_with(3);
        let (a, b, c) = (k.task(0).unwrap(), k.task(1).unwrap(), k.task(2).unwrap());
        let lock = ResLock::new(2);

        assert_eq!(lock.reserve(&k, a, 2), Ok(()));
        assert!(lock.use_available(2));
        assert_eq!(lock.reserve(&k, b, 1), Err(ReserveError::WouldBlock));
        assert_eq!(lock.reserve(&k, c, 1), Err(ReserveError::WouldBlock));
        lock.make_available(&k, 2);
        assert_eq!(lock.owner(), Some(b));

        // A was never owner; its release must not strip b of its turn.
        lock.release(&k, a);
        assert_eq!(lock.owner(), Some(b));
        assert_eq!(k.state(c), TaskState::Suspended);

        lock.release(&k, b);
        assert_eq!(lock.owner(), Some(c));
        assert_eq!(k.state(c), TaskState::Ready);
    }

    #[test]
    fn test_foreign_task_is_refused() {
        let k = kernel_with(1);
        let other = Kernel::new();
        other.attach(3).unwrap();
        let stranger = other.task(2).unwrap();
        let lock = ResLock::new(2);

        assert!(lock.use_available(2));
        assert_eq!(lock.reserve(&k, stranger, 1), Err(ReserveError::InvalidTask));
        assert_eq!(lock.waiting(), 0);
        assert!(ReserveError::InvalidTask.is_permanent());
    }

    #[test]
    fn test_make_available_caps_at_max() {
        let k = kernel_with(1);
        let lock = ResLock::new(2);
        lock.make_available(&k, 10);
        assert_eq!(lock.available(), 2);
        assert_eq!(lock.max(), 2);
    }

    #[test]
    fn test_two_dimensions_must_both_fit() {
        let k = kernel_with(2);
        let (a, b) = (k.task(0).unwrap(), k.task(1).unwrap());
        let lock = Res2Lock::new(2, 16);

        assert_eq!(lock.reserve(&k, a, 3, 1), Err(ReserveError::Unsatisfiable));
        assert_eq!(lock.reserve(&k, a, 1, 17), Err(ReserveError::Unsatisfiable));

        // Immediate grant, consumed, never released.
        assert_eq!(lock.reserve(&k, a, 1, 10), Ok(()));
        assert_eq!(lock.owner(), None);
        assert!(lock.use_available(1, 10));
        assert_eq!(lock.available(), (1, 6));

        assert_eq!(lock.reserve(&k, b, 1, 8), Err(ReserveError::WouldBlock));
        // Slots alone are not enough.
        lock.make_available(&k, 1, 0);
        assert_eq!(lock.owner(), None);
        assert_eq!(k.state(b), TaskState::Suspended);
        lock.make_available(&k, 0, 2);
        assert_eq!(lock.owner(), Some(b));
        assert_eq!(k.state(b), TaskState::Ready);
        assert_eq!(lock.available(), (2, 8));
    }
}
