#![allow(dead_code)]

use procpool::config::WorkerOptions;
use procpool::{PoolConfig, SpawnSpec, WorkerFailurePolicy};
use serde_json::Value;

/// Program name recorded in fake spawns; nothing is ever executed.
pub const FAKE_PROGRAM: &str = "fake-worker";

/// Builder for `PoolConfig` to simplify test setup.
///
/// Defaults differ from the library defaults in one way: worker stderr is
/// not forwarded, so test output stays readable.
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    pub fn new(workers: usize) -> Self {
        Self {
            config: PoolConfig::new(workers, SpawnSpec::new(FAKE_PROGRAM)).forward_stderr(false),
        }
    }

    pub fn program(mut self, spawn: SpawnSpec) -> Self {
        self.config.worker.spawn = spawn;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.config = self.config.lazy_boot(true);
        self
    }

    pub fn init_data(mut self, data: Value) -> Self {
        self.config = self.config.init_data(data);
        self
    }

    pub fn drop_failed_workers(mut self) -> Self {
        self.config = self.config.on_worker_failure(WorkerFailurePolicy::DropWorker);
        self
    }

    pub fn max_reboots(mut self, n: u32) -> Self {
        self.config = self.config.max_reboots_per_task(n);
        self
    }

    pub fn stderr_limit(mut self, bytes: usize) -> Self {
        self.config = self.config.stderr_limit(bytes);
        self
    }

    pub fn name_prefix(mut self, prefix: &str) -> Self {
        self.config = self.config.name_prefix(prefix);
        self
    }

    pub fn build(self) -> PoolConfig {
        self.config
    }

    /// Just the per-worker part, for standalone workers.
    pub fn worker_options(self) -> WorkerOptions {
        self.config.worker
    }
}
