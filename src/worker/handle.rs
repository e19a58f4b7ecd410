// src/worker/handle.rs

//! Standalone worker driven by its own Tokio task.
//!
//! [`WorkerHandle`] is a thin async shell around [`Worker`]: one actor task
//! owns the state machine and multiplexes caller commands with subprocess
//! events, so the worker itself never needs a lock.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::config::WorkerOptions;
use crate::errors::{PoolError, Result};
use crate::process::{ProcessSpawner, WorkerEvent};
use crate::types::WorkerId;

use super::core::{Worker, WorkerState};
use super::task::{task_channel, TaskFuture};

const EVENT_CHANNEL_CAPACITY: usize = 64;

enum Command {
    Send {
        payload: Value,
        reply: oneshot::Sender<Result<TaskFuture>>,
    },
    Destroy {
        done: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<WorkerState>,
    },
}

/// Cloneable handle to a worker running on its own actor task.
///
/// Dropping every handle destroys the worker gracefully.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    tx: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    /// Boot the subprocess and start the actor. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(
        id: WorkerId,
        name: impl Into<String>,
        options: WorkerOptions,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>(EVENT_CHANNEL_CAPACITY);
        let worker = Worker::boot(id, name, Arc::new(options), spawner, event_tx)?;

        let (tx, rx) = mpsc::unbounded_channel::<Command>();
        tokio::spawn(run_worker(worker, rx, event_rx));
        Ok(Self { id, tx })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Submit a task.
    ///
    /// The outer `Result` carries usage errors (busy, destroyed, non-object
    /// payload); the returned future resolves to the task's own outcome.
    pub async fn send_message(&self, payload: Value) -> Result<TaskFuture> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send { payload, reply })
            .map_err(|_| PoolError::WorkerDestroyed)?;
        rx.await.map_err(|_| PoolError::WorkerDestroyed)?
    }

    /// Destroy the worker once its outstanding work has settled. Resolves
    /// when the subprocess is gone.
    ///
    /// The request is registered when this is called, so a `send_message`
    /// issued afterwards is refused even if the returned future has not been
    /// polled yet.
    pub fn destroy(&self) -> impl Future<Output = ()> + Send + use<> {
        let (done, rx) = oneshot::channel();
        // Actor already finished, which only happens after destruction.
        let sent = self.tx.send(Command::Destroy { done }).is_ok();
        async move {
            if sent {
                let _ = rx.await;
            }
        }
    }

    pub async fn state(&self) -> WorkerState {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::State { reply }).is_err() {
            return WorkerState::Destroyed;
        }
        rx.await.unwrap_or(WorkerState::Destroyed)
    }
}

async fn run_worker(
    mut worker: Worker,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut event_rx: mpsc::Receiver<WorkerEvent>,
) {
    debug!(worker = %worker.name(), "worker actor started");
    let mut handles_alive = true;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if handles_alive => match cmd {
                Some(Command::Send { payload, reply }) => {
                    let (task_reply, future) = task_channel();
                    let res = worker.dispatch(payload, task_reply).map(|()| future);
                    let _ = reply.send(res);
                }
                Some(Command::Destroy { done }) => worker.destroy(Some(done)),
                Some(Command::State { reply }) => {
                    let _ = reply.send(worker.state());
                }
                None => {
                    debug!(worker = %worker.name(), "all worker handles dropped; destroying");
                    handles_alive = false;
                    worker.destroy(None);
                }
            },

            Some(event) = event_rx.recv() => {
                if let Err(err) = worker.handle_event(event) {
                    error!(worker = %worker.name(), error = %err, "worker hit a fatal condition");
                }
            }

            else => break,
        }

        if !handles_alive && worker.is_destroyed() {
            break;
        }
    }

    info!(worker = %worker.name(), "worker actor finished");
}
