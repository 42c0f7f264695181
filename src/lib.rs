//! # coop-rtos
//!
//! A cooperative micro-kernel for single-core Cortex-M parts.
//!
//! ## Overview
//!
//! Tasks are run to their next yield point in a fixed round-robin table.
//! Nothing is preempted: a task gives the CPU back by returning from
//! [`Task::run`], or, for a coroutine task, by awaiting one of the kernel's
//! yield or reserve futures. Readiness is tracked in one place, the kernel's
//! per-task delay array:
//!
//! - `0`: ready, run on the next pass
//! - `INFINITE`: suspended until something resumes it
//! - anything else: milliseconds left to wait
//!
//! Shared resources are guarded by FIFO locks that suspend a blocked task and
//! resume it once it has been handed the resource. The bus controller builds
//! on a two-dimensional counting lock to admit requests only when both a
//! stream slot and enough shared-buffer bytes are free.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                    Application Tasks                    │
//! │          impl Task  ·  AsyncTask(async body)            │
//! ├────────────────────────────────────────────────────────┤
//! │  Scheduler (scheduler.rs)        Controller             │
//! │  ─ begin()                       (controller.rs)        │
//! │  ─ dispatch(time_slice)          ─ reserve / submit     │
//! │                                  ─ end_processing_…     │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Kernel      │  Locks (lock/)   │  Streams (stream.rs) │
//! │  kernel.rs   │  Mutex · Signal  │  flags · spans       │
//! │  delays      │  ResourceLock    │                      │
//! │  yield/resume│  ResLock/Res2Lock│                      │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │   Ring buffers (queue.rs) · Shared state (sync.rs)     │
//! ├────────────────────────────────────────────────────────┤
//! │   Arch port (arch/cortex_m.rs): SysTick clock · idle   │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: every table, queue and buffer has a compile-time size
//! - **Coroutine frames** are pinned futures owned by the caller
//! - **Interrupt safety**: all shared state sits behind `critical_section`
//!
//! The library builds for the host as well, which is how the unit tests run.

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod async_task;
pub mod config;
pub mod controller;
pub mod kernel;
pub mod lock;
pub mod queue;
pub mod scheduler;
pub mod stream;
pub mod sync;
pub mod task;

pub use async_task::AsyncTask;
pub use controller::{Controller, RequestProcessor, SubmitError};
pub use kernel::{Kernel, KernelError};
pub use lock::{Mutex, Res2Lock, ResLock, ReserveError, ResourceLock, Signal};
pub use scheduler::{Clock, Scheduler};
pub use stream::{BusError, Completion, StreamFlags, StreamRef};
pub use task::{Task, TaskId, TaskState};
