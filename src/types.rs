use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Identity of a worker inside a pool, used for diagnostics and for routing
/// subprocess events back to their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// What the pool does when one of its workers hits a fatal condition
/// (failed handshake, or a protocol violation with no task to blame).
///
/// - `Abort`: tear the whole pool down; every outstanding task is rejected
///   and later calls fail (default behaviour).
/// - `DropWorker`: remove only the broken worker and keep going with the
///   remaining ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFailurePolicy {
    Abort,
    DropWorker,
}

impl Default for WorkerFailurePolicy {
    fn default() -> Self {
        WorkerFailurePolicy::Abort
    }
}

impl FromStr for WorkerFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(WorkerFailurePolicy::Abort),
            "drop_worker" | "drop-worker" => Ok(WorkerFailurePolicy::DropWorker),
            other => Err(format!(
                "invalid on_worker_failure: {other} (expected \"abort\" or \"drop_worker\")"
            )),
        }
    }
}

/// How a subprocess ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn with_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn with_signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code: {code}, ")?,
            None => write!(f, "exit code: null, ")?,
        }
        match self.signal {
            Some(sig) => write!(f, "exit signal: {}", signal_name(sig)),
            None => write!(f, "exit signal: null"),
        }
    }
}

/// Conventional POSIX name for the common termination signals.
fn signal_name(sig: i32) -> String {
    let name = match sig {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        6 => "SIGABRT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return format!("signal {sig}"),
    };
    name.to_string()
}
