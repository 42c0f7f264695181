//! # Architecture Abstraction Layer
//!
//! Hardware hooks the kernel needs on target: the tick clock and idle.
//! Everything above this layer runs unchanged on the host.

pub mod cortex_m;
