// src/worker/mod.rs

//! One supervised worker subprocess.
//!
//! - [`core`] holds the synchronous protocol state machine (`Worker`).
//! - [`task`] holds task records, the reply/future pair and the reboot budget.
//! - [`handle`] runs a `Worker` on its own actor task for standalone use.

pub mod core;
pub mod handle;
pub mod task;

pub use self::core::{Worker, WorkerState, WorkerStep};
pub use handle::WorkerHandle;
pub use task::{task_channel, RetryBudget, TaskFuture, TaskReply, TaskResult};
