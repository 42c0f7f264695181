//! Exclusive locks: [`Mutex`] (FIFO, owner is the queue head) and
//! [`ResourceLock`] (the owner may nest reservations).

use core::future::Future;

use super::{check_task, is_waiting, wait_list, ReserveError, WaitList};
use crate::async_task::Acquire;
use crate::kernel::Kernel;
use crate::sync::Shared;
use crate::task::TaskId;

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

struct MutexState {
    /// Head is the owner; the rest wait in arrival order.
    queue: WaitList,
}

/// Exclusive FIFO lock.
pub struct Mutex {
    state: Shared<MutexState>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            state: Shared::new(MutexState { queue: wait_list() }),
        }
    }

    /// Take the lock for `task`, or queue and suspend it.
    ///
    /// Calling again while already the owner is a no-op that succeeds.
    pub fn reserve(&self, kernel: &Kernel, task: TaskId) -> Result<(), ReserveError> {
        check_task(kernel, task)?;
        self.state.lock(|s| match s.queue.peek_head(0) {
            None => {
                s.queue.add_tail(task);
                log::trace!("mutex: granted to {task}");
                Ok(())
            }
            Some(owner) if owner == task => Ok(()),
            Some(owner) => {
                if !is_waiting(&s.queue, task) {
                    if !s.queue.add_tail(task) {
                        return Err(ReserveError::WaitListFull);
                    }
                    log::trace!("mutex: {task} queued behind {owner}");
                }
                match kernel.suspend_task(task) {
                    Ok(()) => Err(ReserveError::WouldBlock),
                    Err(_) => Err(ReserveError::InvalidTask),
                }
            }
        })
    }

    /// Blocking form of [`reserve`](Self::reserve) for coroutine tasks.
    pub fn reserve_async<'a>(
        &'a self,
        kernel: &'a Kernel,
    ) -> impl Future<Output = Result<(), ReserveError>> + 'a {
        Acquire::new(kernel, move |task| self.reserve(kernel, task))
    }

    /// Drop `task`'s ownership and hand the lock to the next waiter, if any.
    /// A task that does not own the lock changes nothing. Returns the owner
    /// afterwards. Interrupt-safe.
    pub fn release(&self, kernel: &Kernel, task: TaskId) -> Option<TaskId> {
        self.state.lock(|s| {
            match s.queue.peek_head(0) {
                None => {
                    log::warn!("mutex: {task} released without an owner");
                    return None;
                }
                Some(owner) if owner != task => {
                    log::warn!("mutex: {task} released, but {owner} owns it");
                    return Some(owner);
                }
                Some(_) => {}
            }
            let old = s.queue.remove_head()?;
            let next = s.queue.peek_head(0);
            if let Some(next) = next {
                log::trace!("mutex: {old} hands over to {next}");
                let _ = kernel.resume(next, 0);
            }
            next
        })
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock(|s| s.queue.peek_head(0))
    }

    /// Number of tasks queued behind the owner.
    pub fn waiting(&self) -> usize {
        self.state.lock(|s| s.queue.count().saturating_sub(1))
    }
}

// ---------------------------------------------------------------------------
// ResourceLock
// ---------------------------------------------------------------------------

struct ResourceState {
    owner: Option<TaskId>,
    /// Outstanding reservations by the owner. Zero right after a handoff,
    /// until the new owner's retry claims it.
    depth: u16,
    waiters: WaitList,
}

/// Reentrant exclusive lock: the owner may reserve again without queueing,
/// and only the matching number of releases hands it on.
pub struct ResourceLock {
    state: Shared<ResourceState>,
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceLock {
    pub const fn new() -> Self {
        Self {
            state: Shared::new(ResourceState {
                owner: None,
                depth: 0,
                waiters: wait_list(),
            }),
        }
    }

    pub fn reserve(&self, kernel: &Kernel, task: TaskId) -> Result<(), ReserveError> {
        check_task(kernel, task)?;
        self.state.lock(|s| match s.owner {
            None => {
                s.owner = Some(task);
                s.depth = 1;
                log::trace!("resource lock: granted to {task}");
                Ok(())
            }
            Some(owner) if owner == task => {
                s.depth = s.depth.saturating_add(1);
                Ok(())
            }
            Some(owner) => {
                if !is_waiting(&s.waiters, task) {
                    if !s.waiters.add_tail(task) {
                        return Err(ReserveError::WaitListFull);
                    }
                    log::trace!("resource lock: {task} queued behind {owner}");
                }
                match kernel.suspend_task(task) {
                    Ok(()) => Err(ReserveError::WouldBlock),
                    Err(_) => Err(ReserveError::InvalidTask),
                }
            }
        })
    }

    pub fn reserve_async<'a>(
        &'a self,
        kernel: &'a Kernel,
    ) -> impl Future<Output = Result<(), ReserveError>> + 'a {
        Acquire::new(kernel, move |task| self.reserve(kernel, task))
    }

    /// Undo one of `task`'s reservations. At depth zero the lock passes to
    /// the next waiter. Returns the owner afterwards. Interrupt-safe.
    pub fn release(&self, kernel: &Kernel, task: TaskId) -> Option<TaskId> {
        self.state.lock(|s| {
            match s.owner {
                None => {
                    log::warn!("resource lock: {task} released without an owner");
                    return None;
                }
                Some(owner) if owner != task => {
                    log::warn!("resource lock: {task} released, but {owner} owns it");
                    return Some(owner);
                }
                Some(_) => {}
            }
            s.depth = s.depth.saturating_sub(1);
            if s.depth > 0 {
                return s.owner;
            }
            s.owner = s.waiters.remove_head();
            if let Some(next) = s.owner {
                log::trace!("resource lock: handed to {next}");
                let _ = kernel.resume(next, 0);
            }
            s.owner
        })
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock(|s| s.owner)
    }

    pub fn depth(&self) -> u16 {
        self.state.lock(|s| s.depth)
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
        let k = Kernel::new();
        k.attach(count).unwrap();
        k
    }

    #[test]
    fn test_mutex_fifo_handoff() {
        let k = kernel_with(3);
        let (a, b, c) = (k.task(0).unwrap(), k.task(1).unwrap(), k.task(2).unwrap());
        let m = Mutex::new();

        assert_eq!(m.reserve(&k, a), Ok(()));
        assert_eq!(m.reserve(&k, c), Err(ReserveError::WouldBlock));
        assert_eq!(m.reserve(&k, b), Err(ReserveError::WouldBlock));
        assert_eq!(k.state(c), TaskState::Suspended);
        assert_eq!(k.state(b), TaskState::Suspended);
        assert_eq!(m.waiting(), 2);

        // Retrying while queued neither duplicates nor skips ahead.
        assert_eq!(m.reserve(&k, b), Err(ReserveError::WouldBlock));
        assert_eq!(m.waiting(), 2);

        assert_eq!(m.release(&k, a), Some(c));
        assert_eq!(k.state(c), TaskState::Ready);
        assert_eq!(k.state(b), TaskState::Suspended);
        assert_eq!(m.reserve(&k, c), Ok(()));

        assert_eq!(m.release(&k, c), Some(b));
        assert_eq!(m.release(&k, b), None);
        assert_eq!(m.owner(), None);
    }

    #[test]
    fn test_resource_lock_nesting() {
        let k = kernel_with(2);
        let (a, b) = (k.task(0).unwrap(), k.task(1).unwrap());
        let r = ResourceLock::new();

        assert_eq!(r.reserve(&k, a), Ok(()));
        assert_eq!(r.reserve(&k, a), Ok(()));
        assert_eq!(r.depth(), 2);
        assert_eq!(r.reserve(&k, b), Err(ReserveError::WouldBlock));

        assert_eq!(r.release(&k, a), Some(a));
        assert_eq!(k.state(b), TaskState::Suspended);

        assert_eq!(r.release(&k, a), Some(b));
        assert_eq!(k.state(b), TaskState::Ready);
        assert_eq!(r.depth(), 0);

        // The new owner's retry claims the handoff without over-counting.
        assert_eq!(r.reserve(&k, b), Ok(()));
        assert_eq!(r.depth(), 1);
        assert_eq!(r.release(&k, b), None);
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let k = kernel_with(3);
        let (a, b, c) = (k.task(0).unwrap(), k.task(1).unwrap(), k.task(2).unwrap());
        let m = Mutex::new();
        let r = ResourceLock::new();

        assert_eq!(m.reserve(&k, a), Ok(()));
        assert_eq!(m.reserve(&k, b), Err(ReserveError::WouldBlock));
        assert_eq!(m.release(&k, c), Some(a));
        assert_eq!(m.owner(), Some(a));
        assert_eq!(m.waiting(), 1);
        assert_eq!(k.state(b), TaskState::Suspended);

        assert_eq!(r.reserve(&k, a), Ok(()));
        assert_eq!(r.release(&k, b), Some(a));
        assert_eq!(r.depth(), 1);
    }

    #[test]
    fn test_foreign_task_is_not_queued() {
        let k = kernel_with(1);
        let other = Kernel::new();
        other.attach(4).unwrap();
        let stranger = other.task(3).unwrap();
        let m = Mutex::new();
        let r = ResourceLock::new();

        assert_eq!(m.reserve(&k, k.task(0).unwrap()), Ok(()));
        assert_eq!(m.reserve(&k, stranger), Err(ReserveError::InvalidTask));
        assert_eq!(m.waiting(), 0);
        assert_eq!(r.reserve(&k, stranger), Err(ReserveError::InvalidTask));
        assert_eq!(r.owner(), None);
    }
}
