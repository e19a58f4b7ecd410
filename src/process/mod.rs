// src/process/mod.rs

//! Subprocess layer.
//!
//! - [`spawner`] provides the `ProcessSpawner` trait and the production
//!   `CommandSpawner` built on `tokio::process::Command`.
//! - [`monitor`] owns the per-process writer/monitor tasks that feed
//!   [`WorkerEvent`]s back to whoever drives the worker.
//! - [`stderr`] keeps a bounded, middle-truncated copy of a process's stderr.

pub mod monitor;
pub mod spawner;
pub mod stderr;

pub use monitor::{attach, ProcessLink};
pub use spawner::{
    CommandSpawner, ProcessControl, ProcessFuture, ProcessSpawner, SpawnSpec, SpawnedProcess,
};
pub use stderr::StderrBuffer;

use crate::types::{ExitInfo, WorkerId};

/// Something observed on one subprocess of one worker.
///
/// `generation` identifies the subprocess instance: it changes every time the
/// worker (re)boots, so events from a replaced process can be recognised and
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    pub generation: u64,
    pub kind: ProcessEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(ExitInfo),
}
