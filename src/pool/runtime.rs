// src/pool/runtime.rs

//! Pool actor and its handle.
//!
//! One Tokio task owns every [`Worker`] plus the [`Scheduler`] and
//! multiplexes:
//! - commands from [`Pool`] handles (send, broadcast, destroy, stats),
//! - subprocess events from all workers, on one shared channel.
//!
//! All scheduling decisions happen on that task, so nothing here needs a lock.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{validate_config, PoolConfig, WorkerOptions};
use crate::errors::{PoolError, Result, TaskError};
use crate::process::{CommandSpawner, ProcessSpawner, WorkerEvent};
use crate::protocol::{as_task_payload, render};
use crate::types::{WorkerFailurePolicy, WorkerId};
use crate::worker::{task_channel, TaskFuture, TaskReply, TaskResult, Worker, WorkerStep};

use super::scheduler::Scheduler;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Point-in-time view of the pool, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    /// Tasks waiting for any worker.
    pub queued: usize,
    /// Broadcast copies waiting for a specific worker.
    pub queued_broadcasts: usize,
}

/// Resolves once every copy of a broadcast task has settled.
///
/// Results come back in worker order, tagged with the worker that ran them.
#[derive(Debug)]
pub struct BroadcastFuture {
    pending: Vec<(WorkerId, Option<TaskFuture>)>,
    results: Vec<Option<TaskResult>>,
}

impl BroadcastFuture {
    fn new(futures: Vec<(WorkerId, TaskFuture)>) -> Self {
        let results = futures.iter().map(|_| None).collect();
        let pending = futures.into_iter().map(|(id, f)| (id, Some(f))).collect();
        Self { pending, results }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Future for BroadcastFuture {
    type Output = Vec<(WorkerId, TaskResult)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut done = true;

        for (slot, (_, future)) in this.results.iter_mut().zip(this.pending.iter_mut()) {
            let Some(f) = future.as_mut() else {
                continue;
            };
            match Pin::new(f).poll(cx) {
                Poll::Ready(result) => {
                    *slot = Some(result);
                    *future = None;
                }
                Poll::Pending => done = false,
            }
        }

        if !done {
            return Poll::Pending;
        }

        let ids = this.pending.iter().map(|(id, _)| *id);
        let results = this.results.drain(..).flatten();
        Poll::Ready(ids.zip(results).collect())
    }
}

enum PoolCommand {
    Send {
        payload: Value,
        reply: oneshot::Sender<Result<TaskFuture>>,
    },
    Broadcast {
        payload: Value,
        reply: oneshot::Sender<Result<BroadcastFuture>>,
    },
    Destroy {
        done: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
}

/// Cloneable handle to a running pool.
///
/// Dropping every handle destroys the pool gracefully: queued work still
/// runs to completion, then the workers are shut down.
#[derive(Debug, Clone)]
pub struct Pool {
    tx: mpsc::UnboundedSender<PoolCommand>,
}

impl Pool {
    /// Validate `config`, boot the workers (unless `lazy_boot`) and start the
    /// pool actor. Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig, spawner: Arc<dyn ProcessSpawner>) -> Result<Self> {
        validate_config(&config)?;

        let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>(EVENT_CHANNEL_CAPACITY);
        let mut actor = PoolActor::new(config, spawner, event_tx);

        if !actor.config.lazy_boot {
            for _ in 0..actor.config.workers {
                // Workers booted so far are dropped with `actor`, which
                // kills their processes.
                actor.boot_worker()?;
            }
        }

        info!(
            workers = actor.config.workers,
            lazy_boot = actor.config.lazy_boot,
            prefix = %actor.config.name_prefix,
            "worker pool started"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(actor.run(rx, event_rx));
        Ok(Self { tx })
    }

    /// Pool whose workers are real subprocesses.
    pub fn with_command_spawner(config: PoolConfig) -> Result<Self> {
        Self::new(config, Arc::new(CommandSpawner))
    }

    /// Submit a task to the first available worker.
    ///
    /// The outer `Result` carries usage errors (pool destroyed or being
    /// destroyed, pool terminated, non-object payload). The returned future
    /// resolves to the task's own outcome.
    pub async fn send_message(&self, payload: Value) -> Result<TaskFuture> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Send { payload, reply })
            .map_err(|_| PoolError::PoolShutDown)?;
        rx.await.map_err(|_| PoolError::PoolShutDown)?
    }

    /// Submit a copy of `payload` to every worker currently in the pool,
    /// exactly once each.
    pub async fn send_message_to_all_workers(&self, payload: Value) -> Result<BroadcastFuture> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Broadcast { payload, reply })
            .map_err(|_| PoolError::PoolShutDown)?;
        rx.await.map_err(|_| PoolError::PoolShutDown)?
    }

    /// Request destruction and wait for it.
    ///
    /// The request is registered as soon as this is called, before the
    /// returned future is polled: tasks submitted afterwards are refused.
    /// Already accepted tasks (queued or in flight) still complete. Calling
    /// it again, from any handle, waits for the same shutdown.
    pub fn destroy(&self) -> impl Future<Output = Result<()>> + Send + use<> {
        let (done, rx) = oneshot::channel();
        let sent = self.tx.send(PoolCommand::Destroy { done }).is_ok();
        async move {
            if !sent {
                return Ok(());
            }
            rx.await.unwrap_or(Ok(()))
        }
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolCommand::Stats { reply })
            .map_err(|_| PoolError::PoolShutDown)?;
        rx.await.map_err(|_| PoolError::PoolShutDown)
    }
}

#[derive(Debug)]
struct QueuedTask {
    payload: Value,
    reply: TaskReply,
}

struct PoolActor {
    config: PoolConfig,
    options: Arc<WorkerOptions>,
    spawner: Arc<dyn ProcessSpawner>,
    events: mpsc::Sender<WorkerEvent>,
    workers: BTreeMap<WorkerId, Worker>,
    next_id: usize,
    scheduler: Scheduler<QueuedTask>,
    destroy_requested: bool,
    /// `destroy` was issued to every worker.
    tearing_down: bool,
    finished: bool,
    destroy_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// Set when the pool was aborted after a fatal worker error.
    terminated: Option<String>,
}

impl PoolActor {
    fn new(
        config: PoolConfig,
        spawner: Arc<dyn ProcessSpawner>,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        let options = Arc::new(config.worker.clone());
        Self {
            config,
            options,
            spawner,
            events,
            workers: BTreeMap::new(),
            next_id: 0,
            scheduler: Scheduler::new(),
            destroy_requested: false,
            tearing_down: false,
            finished: false,
            destroy_waiters: Vec::new(),
            terminated: None,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
        mut event_rx: mpsc::Receiver<WorkerEvent>,
    ) {
        debug!("pool actor started");
        let mut handles_alive = true;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv(), if handles_alive => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        handles_alive = false;
                        if !self.destroy_requested {
                            info!("all pool handles dropped; destroying pool");
                            self.destroy_requested = true;
                        }
                    }
                },

                Some(event) = event_rx.recv() => self.on_event(event),

                else => break,
            }

            self.maybe_finish_destroy();

            if !handles_alive && self.finished {
                break;
            }
        }

        info!("pool actor finished");
    }

    fn handle_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Send { payload, reply } => {
                let _ = reply.send(self.submit(payload));
            }
            PoolCommand::Broadcast { payload, reply } => {
                let _ = reply.send(self.broadcast(payload));
            }
            PoolCommand::Destroy { done } => self.request_destroy(done),
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn check_accepts(&self, payload: &Value) -> Result<()> {
        if let Some(reason) = &self.terminated {
            return Err(PoolError::Terminated(reason.clone()));
        }
        if self.destroy_requested {
            return Err(PoolError::PoolShutDown);
        }
        if as_task_payload(payload).is_none() {
            return Err(PoolError::InvalidPayload(render(payload)));
        }
        Ok(())
    }

    fn submit(&mut self, payload: Value) -> Result<TaskFuture> {
        self.check_accepts(&payload)?;

        if self.config.lazy_boot && self.workers.len() < self.config.workers {
            if let Err(err) = self.boot_worker() {
                self.on_worker_fatal(None, err);
                if let Some(reason) = &self.terminated {
                    return Err(PoolError::Terminated(reason.clone()));
                }
            }
        }

        if self.workers.is_empty() {
            return Err(PoolError::Terminated(
                "no workers are left in the pool".to_string(),
            ));
        }

        let (reply, future) = task_channel();
        let task = QueuedTask { payload, reply };
        match self.scheduler.take_idle() {
            Some(id) => self.dispatch(id, task),
            None => self.scheduler.enqueue(task),
        }
        Ok(future)
    }

    fn broadcast(&mut self, payload: Value) -> Result<BroadcastFuture> {
        self.check_accepts(&payload)?;

        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        debug!(workers = ids.len(), "broadcasting task");

        let mut futures = Vec::with_capacity(ids.len());
        for id in ids {
            let (reply, future) = task_channel();
            futures.push((id, future));
            let task = QueuedTask {
                payload: payload.clone(),
                reply,
            };
            if self.scheduler.claim_idle(id) {
                self.dispatch(id, task);
            } else {
                self.scheduler.enqueue_for(id, task);
            }
        }
        Ok(BroadcastFuture::new(futures))
    }

    fn request_destroy(&mut self, done: oneshot::Sender<Result<()>>) {
        if self.finished {
            let _ = done.send(self.destroy_outcome());
            return;
        }
        if !self.destroy_requested {
            info!(
                busy = self.workers.values().filter(|w| w.is_busy()).count(),
                queued = self.scheduler.queued_len() + self.scheduler.direct_len(),
                "pool destroy requested"
            );
        }
        self.destroy_requested = true;
        self.destroy_waiters.push(done);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.len(),
            idle: self.scheduler.idle_len(),
            busy: self.workers.values().filter(|w| w.is_busy()).count(),
            queued: self.scheduler.queued_len(),
            queued_broadcasts: self.scheduler.direct_len(),
        }
    }

    fn boot_worker(&mut self) -> Result<WorkerId> {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        let name = format!("{}-{}", self.config.name_prefix, id.0);

        let worker = Worker::boot(
            id,
            name,
            Arc::clone(&self.options),
            Arc::clone(&self.spawner),
            self.events.clone(),
        )?;
        debug!(worker = %worker.name(), "worker added to pool");

        self.workers.insert(id, worker);
        self.scheduler.add_idle(id);
        Ok(id)
    }

    fn dispatch(&mut self, id: WorkerId, task: QueuedTask) {
        let Some(worker) = self.workers.get_mut(&id) else {
            task.reply.reject(TaskError::Terminated(format!("{id} is no longer in the pool")));
            return;
        };

        match worker.dispatch(task.payload, task.reply) {
            Ok(()) => {}
            Err(err) if err.is_worker_fatal() => self.on_worker_fatal(Some(id), err),
            Err(err) => {
                // The reply was rejected by the worker; the pool's view of
                // this worker is out of sync, so take it out of rotation.
                error!(worker = %id, error = %err, "worker refused a scheduled task");
                self.on_worker_fatal(Some(id), err);
            }
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        let id = event.worker;
        let Some(worker) = self.workers.get_mut(&id) else {
            debug!(worker = %id, "dropping event for a worker no longer in the pool");
            return;
        };

        match worker.handle_event(event) {
            Ok(Some(WorkerStep::Settled)) => self.on_worker_free(id),
            Ok(Some(WorkerStep::Initialized | WorkerStep::Destroyed) | None) => {}
            Err(err) => self.on_worker_fatal(Some(id), err),
        }
    }

    /// `id` settled its task; hand it the next one or mark it idle.
    fn on_worker_free(&mut self, id: WorkerId) {
        if self.tearing_down {
            return;
        }
        if let Some(next) = self.scheduler.next_for(id) {
            self.dispatch(id, next);
        }
    }

    /// Apply the configured policy to a fatal worker error. `id` is `None`
    /// when the worker could not even be booted.
    fn on_worker_fatal(&mut self, id: Option<WorkerId>, err: PoolError) {
        if self.terminated.is_some() {
            return;
        }

        match self.config.on_worker_failure {
            WorkerFailurePolicy::Abort => self.abort(err.to_string()),
            WorkerFailurePolicy::DropWorker => {
                let reason = err.to_string();
                warn!(worker = ?id, error = %reason, "dropping failed worker from the pool");

                if let Some(id) = id {
                    self.workers.remove(&id);
                    for task in self.scheduler.remove_worker(id) {
                        task.reply.reject(TaskError::Terminated(reason.clone()));
                    }
                }

                self.replace_capacity(&reason);
            }
        }
    }

    /// After dropping a worker: make sure queued work still has someone to
    /// run it.
    fn replace_capacity(&mut self, reason: &str) {
        if !self.workers.is_empty() || self.scheduler.queued_len() == 0 {
            return;
        }

        if self.config.lazy_boot && !self.destroy_requested {
            match self.boot_worker() {
                Ok(id) => {
                    if self.scheduler.claim_idle(id) {
                        if let Some(next) = self.scheduler.next_for(id) {
                            self.dispatch(id, next);
                        }
                    }
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "could not boot a replacement worker");
                }
            }
        }

        error!(
            queued = self.scheduler.queued_len(),
            "no workers left to run queued tasks; rejecting them"
        );
        for task in self.scheduler.drain_queue() {
            task.reply.reject(TaskError::Terminated(reason.to_string()));
        }
    }

    /// Fatal error under [`WorkerFailurePolicy::Abort`]: reject everything
    /// and kill every worker.
    fn abort(&mut self, reason: String) {
        error!(%reason, "aborting worker pool");
        self.terminated = Some(reason.clone());
        self.destroy_requested = true;
        self.tearing_down = true;

        for task in self.scheduler.drain_all() {
            task.reply.reject(TaskError::Terminated(reason.clone()));
        }
        for worker in self.workers.values_mut() {
            worker.abort(&reason);
        }
    }

    fn maybe_finish_destroy(&mut self) {
        if !self.destroy_requested || self.finished {
            return;
        }

        if !self.tearing_down {
            let busy = self.workers.values().any(Worker::is_busy);
            if busy || self.scheduler.has_queued_work() {
                return;
            }
            debug!(workers = self.workers.len(), "pool drained; destroying workers");
            self.tearing_down = true;
            for worker in self.workers.values_mut() {
                worker.destroy(None);
            }
        }

        if !self.workers.values().all(Worker::is_destroyed) {
            return;
        }

        self.finished = true;
        info!("pool destroyed");
        for done in std::mem::take(&mut self.destroy_waiters) {
            let _ = done.send(self.destroy_outcome());
        }
    }

    fn destroy_outcome(&self) -> Result<()> {
        match &self.terminated {
            Some(reason) => Err(PoolError::Terminated(reason.clone())),
            None => Ok(()),
        }
    }
}
