// src/lib.rs

//! Supervise a pool of long-lived worker subprocesses and hand them tasks
//! over a stream of concatenated JSON objects on stdin/stdout.
//!
//! Layers, bottom-up:
//! - [`protocol`]: the incremental JSON framer and the wire messages.
//! - [`process`]: spawning subprocesses and pumping their I/O into events.
//! - [`worker`]: one subprocess's handshake, request/response cycle and
//!   crash recovery.
//! - [`pool`]: scheduling tasks over many workers.
//!
//! ```no_run
//! use procpool::{Pool, PoolConfig, SpawnSpec};
//! use serde_json::json;
//!
//! # async fn demo() -> procpool::Result<()> {
//! let config = PoolConfig::new(4, SpawnSpec::new("/usr/local/bin/my-worker"))
//!     .init_data(json!({ "root": "/srv/project" }));
//! let pool = Pool::with_command_spawner(config)?;
//!
//! let result = pool.send_message(json!({ "file": "a.txt" })).await?.await;
//! println!("{result:?}");
//!
//! pool.destroy().await
//! # }
//! ```

pub mod config;
pub mod errors;
pub mod logging;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod types;
pub mod worker;

pub use config::{load_and_validate, PoolConfig, WorkerOptions};
pub use errors::{CrashReport, PoolError, Result, TaskError};
pub use pool::{BroadcastFuture, Pool, PoolStats};
pub use process::{CommandSpawner, ProcessSpawner, SpawnSpec};
pub use protocol::JsonFramer;
pub use types::{ExitInfo, WorkerFailurePolicy, WorkerId};
pub use worker::{TaskFuture, TaskResult, WorkerHandle, WorkerState};
