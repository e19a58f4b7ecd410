pub mod builders;
pub mod fake_spawner;

use std::sync::{Arc, Once};

use procpool::{Pool, PoolConfig, WorkerHandle, WorkerId};
use procpool::config::WorkerOptions;
use tracing_subscriber::{fmt, EnvFilter};

use crate::fake_spawner::{FakeChildren, FakeSpawner};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=procpool=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Start a pool on a fresh [`FakeSpawner`].
pub fn fake_pool(config: PoolConfig) -> (Pool, FakeSpawner, FakeChildren) {
    let (spawner, children) = FakeSpawner::new();
    let pool = Pool::new(config, Arc::new(spawner.clone())).expect("failed to start pool");
    (pool, spawner, children)
}

/// Start a standalone worker on a fresh [`FakeSpawner`].
pub fn fake_worker(options: WorkerOptions) -> (WorkerHandle, FakeChildren) {
    let (spawner, children) = FakeSpawner::new();
    let worker = WorkerHandle::spawn(WorkerId(0), "test-worker", options, Arc::new(spawner))
        .expect("failed to start worker");
    (worker, children)
}
