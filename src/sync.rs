//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions. Everything the bus ISR can
//! touch (the kernel's delay array, lock counters, the controller's stream
//! pools) lives in a [`Shared`] cell and is only accessed inside a critical
//! section, so main-line check-then-act sequences cannot race a completion
//! interrupt.
//!
//! On Cortex-M the critical section is provided by `cortex-m`'s
//! `critical-section-single-core` implementation (PRIMASK save/restore, so
//! nesting is safe), switched on by the `firmware` feature. Host builds link
//! the `critical-section/std` implementation.

use core::cell::RefCell;

use critical_section::{CriticalSection, Mutex};

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are disabled on entry and restored to their previous state on
/// exit, so calls may nest.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|cs| {
///     // Access shared state safely
/// });
/// ```
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}

/// State shared between main-line code and interrupt handlers.
///
/// A thin wrapper over `critical_section::Mutex<RefCell<T>>` that folds the
/// critical section and the borrow into one call. Borrowing the same cell
/// twice (for instance from a callback invoked while it is borrowed) panics;
/// that is a wiring defect, not a runtime condition.
pub struct Shared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access to the value, inside a critical section.
    #[inline]
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section(|cs| f(&mut *self.inner.borrow_ref_mut(cs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_critical_sections() {
        let outer = Shared::new(1u32);
        let inner = Shared::new(10u32);
        let sum = outer.lock(|a| {
            *a += 1;
            inner.lock(|b| *a + *b)
        });
        assert_eq!(sum, 12);
    }
}
