// src/errors.rs

//! Crate-wide error aliases and helpers.
//!
//! Two families live here:
//! - [`PoolError`]: returned from API calls (usage errors, configuration,
//!   spawning) and used to escalate fatal worker conditions.
//! - [`TaskError`]: the rejection value delivered through a task's future.
//!   It is `Clone` so one fatal condition can reject several tasks.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::types::{ExitInfo, WorkerId};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(
        "Attempted to send a message to a worker that has already been or is in the process of shutting down!"
    )]
    WorkerDestroyed,

    #[error(
        "Attempted to send a message to the worker before the response from a previous message was received! Workers can only process one message at a time."
    )]
    WorkerBusy,

    #[error("Worker messages must always be an object: {0}")]
    InvalidPayload(String),

    #[error(
        "Attempted to send a message after the worker pool has already been or is in the process of shutting down!"
    )]
    PoolShutDown,

    #[error("Error initializing {worker}: {reason}")]
    Initialization { worker: WorkerId, reason: String },

    #[error("Protocol violation from {worker}: {reason}")]
    ProtocolViolation { worker: WorkerId, reason: String },

    #[error("Worker pool terminated: {0}")]
    Terminated(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PoolError {
    /// Whether this error is a fatal condition of a worker (as opposed to a
    /// usage error reported at the call site).
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            PoolError::Initialization { .. } | PoolError::ProtocolViolation { .. }
        )
    }
}

/// Why a task's future was rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The worker program reported an error for this task. The payload is
    /// passed through untouched.
    #[error("worker reported an error: {0}")]
    Worker(Value),

    #[error("{0}")]
    Protocol(String),

    #[error("{0}")]
    Crashed(CrashReport),

    #[error("{0}")]
    Initialization(String),

    #[error("task abandoned: {0}")]
    Terminated(String),
}

impl TaskError {
    /// The opaque payload of a worker-reported error, if that is what this is.
    pub fn worker_payload(&self) -> Option<&Value> {
        match self {
            TaskError::Worker(v) => Some(v),
            _ => None,
        }
    }
}

/// Diagnostic for a subprocess that exited while a task was outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashReport {
    pub worker: WorkerId,
    pub exit: ExitInfo,
    /// Captured stderr, already middle-truncated.
    pub stderr: String,
}

impl fmt::Display for CrashReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Worker process exited before responding! {}\n{}",
            self.exit,
            format_stderr_block(&self.stderr)
        )
    }
}

/// Render captured stderr as an indented block:
///
/// ```text
/// stderr:
///   first line
///   second line
/// ```
pub fn format_stderr_block(stderr: &str) -> String {
    let mut out = String::from("stderr:\n");
    for line in stderr.split('\n') {
        out.push_str("  ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, PoolError>;
