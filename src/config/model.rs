// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::logging::LogLevel;
use crate::process::SpawnSpec;
use crate::types::WorkerFailurePolicy;

/// Default number of stderr bytes kept per subprocess for crash diagnostics.
pub const DEFAULT_STDERR_LIMIT: usize = 16 * 1024;

/// Smallest accepted `stderr_limit`; anything lower makes the head/tail
/// rendering useless.
pub const MIN_STDERR_LIMIT: usize = 64;

/// Configuration file as read from TOML, before validation.
///
/// ```toml
/// [pool]
/// workers = 4
/// lazy_boot = false
/// on_worker_failure = "abort"
///
/// [worker]
/// program = "/usr/local/bin/transform-worker"
/// args = ["--mode", "fast"]
/// init_data = { root = "/srv/project" }
/// max_reboots_per_task = 1
///
/// [log]
/// level = "debug"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub pool: PoolSection,

    pub worker: WorkerSection,

    #[serde(default)]
    pub log: LogSection,
}

/// `[pool]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    /// Number of worker subprocesses (the cap, when booting lazily).
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Boot workers on demand instead of all at construction.
    #[serde(default)]
    pub lazy_boot: bool,

    #[serde(default)]
    pub on_worker_failure: WorkerFailurePolicy,

    /// Prefix for worker names in logs and diagnostics.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
}

fn default_workers() -> usize {
    1
}

fn default_name_prefix() -> String {
    "worker".to_string()
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lazy_boot: false,
            on_worker_failure: WorkerFailurePolicy::default(),
            name_prefix: default_name_prefix(),
        }
    }
}

/// `[worker]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    /// Executable to spawn for every worker.
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Sent to each subprocess in the `{"initData": ...}` handshake.
    #[serde(default)]
    pub init_data: Value,

    /// How many times a crashed subprocess is rebooted for the same task.
    #[serde(default = "default_max_reboots")]
    pub max_reboots_per_task: u32,

    #[serde(default = "default_stderr_limit")]
    pub stderr_limit: usize,

    /// Copy worker stderr to our own stderr as it arrives.
    #[serde(default = "default_true")]
    pub forward_stderr: bool,

    /// Log every batch of decoded worker responses.
    #[serde(default)]
    pub print_child_responses: bool,
}

fn default_max_reboots() -> u32 {
    1
}

fn default_stderr_limit() -> usize {
    DEFAULT_STDERR_LIMIT
}

fn default_true() -> bool {
    true
}

/// `[log]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub level: Option<LogLevel>,
}

/// Per-worker settings shared by every worker of a pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub spawn: SpawnSpec,
    pub init_data: Value,
    pub max_reboots_per_task: u32,
    pub stderr_limit: usize,
    pub forward_stderr: bool,
    pub print_child_responses: bool,
}

impl WorkerOptions {
    pub fn new(spawn: SpawnSpec) -> Self {
        Self {
            spawn,
            init_data: Value::Null,
            max_reboots_per_task: default_max_reboots(),
            stderr_limit: DEFAULT_STDERR_LIMIT,
            forward_stderr: true,
            print_child_responses: false,
        }
    }
}

/// Validated pool configuration.
///
/// Construct it from a file with [`crate::config::load_and_validate`] or
/// directly with [`PoolConfig::new`] and the builder-style setters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub lazy_boot: bool,
    pub on_worker_failure: WorkerFailurePolicy,
    pub name_prefix: String,
    pub worker: WorkerOptions,
    pub log_level: Option<LogLevel>,
}

impl PoolConfig {
    pub fn new(workers: usize, spawn: SpawnSpec) -> Self {
        Self {
            workers,
            lazy_boot: false,
            on_worker_failure: WorkerFailurePolicy::default(),
            name_prefix: default_name_prefix(),
            worker: WorkerOptions::new(spawn),
            log_level: None,
        }
    }

    pub fn lazy_boot(mut self, lazy: bool) -> Self {
        self.lazy_boot = lazy;
        self
    }

    pub fn init_data(mut self, data: Value) -> Self {
        self.worker.init_data = data;
        self
    }

    pub fn on_worker_failure(mut self, policy: WorkerFailurePolicy) -> Self {
        self.on_worker_failure = policy;
        self
    }

    pub fn max_reboots_per_task(mut self, n: u32) -> Self {
        self.worker.max_reboots_per_task = n;
        self
    }

    pub fn stderr_limit(mut self, bytes: usize) -> Self {
        self.worker.stderr_limit = bytes;
        self
    }

    pub fn forward_stderr(mut self, forward: bool) -> Self {
        self.worker.forward_stderr = forward;
        self
    }

    pub fn print_child_responses(mut self, print: bool) -> Self {
        self.worker.print_child_responses = print;
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Only for use after validation has happened elsewhere.
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        let spawn = SpawnSpec::new(raw.worker.program).args(raw.worker.args);
        Self {
            workers: raw.pool.workers,
            lazy_boot: raw.pool.lazy_boot,
            on_worker_failure: raw.pool.on_worker_failure,
            name_prefix: raw.pool.name_prefix,
            worker: WorkerOptions {
                spawn,
                init_data: raw.worker.init_data,
                max_reboots_per_task: raw.worker.max_reboots_per_task,
                stderr_limit: raw.worker.stderr_limit,
                forward_stderr: raw.worker.forward_stderr,
                print_child_responses: raw.worker.print_child_responses,
            },
            log_level: raw.log.level,
        }
    }
}
