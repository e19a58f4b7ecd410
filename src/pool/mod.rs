// src/pool/mod.rs

//! A fixed-size set of workers behind one FIFO queue.
//!
//! - [`scheduler`] is the pure idle/queue bookkeeping.
//! - [`runtime`] is the actor that owns the workers and the [`Pool`] handle
//!   callers talk to.

pub mod runtime;
pub mod scheduler;

pub use runtime::{BroadcastFuture, Pool, PoolStats};
pub use scheduler::Scheduler;
