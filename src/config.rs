//! # Kernel Configuration
//!
//! Compile-time constants governing the scheduler and system behavior.
//! All limits are fixed at compile time; nothing is allocated dynamically.

/// Maximum number of tasks a scheduler table may hold.
/// This bounds the kernel's delay array and every lock wait list, so a
/// task can always be queued on any lock without running out of room.
pub const MAX_TASKS: usize = 8;

/// Delay value meaning "suspended until explicitly resumed".
/// Clock ticks never decrement a task out of this state.
pub const INFINITE: u32 = u32::MAX;

/// SysTick frequency in Hz. One tick is one millisecond of scheduler time.
pub const TICK_HZ: u32 = 1000;

/// Time slice in milliseconds the demo firmware passes to
/// `Scheduler::dispatch`. `0` disables slicing.
pub const DEFAULT_TIME_SLICE_MS: u32 = 10;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Upper bound on request slots per controller. Sizes the controller's
/// free and pending index pools.
pub const MAX_STREAMS: usize = 16;
