// src/worker/core.rs

//! Single-worker protocol state machine.
//!
//! A [`Worker`] owns one subprocess at a time and everything needed to talk
//! to it: the stdout framer, the stderr capture, the handshake status and at
//! most one in-flight task. It performs no waiting of its own; whoever owns
//! the worker (the pool actor, or [`super::WorkerHandle`]) feeds it
//! [`WorkerEvent`]s and reacts to the returned [`WorkerStep`]s.
//!
//! Lifecycle:
//!
//! ```text
//! Initializing -> Ready <-> Busy -> (crash -> reboot -> Initializing)*
//!                                 -> Destroying -> Destroyed
//! ```
//!
//! plus `Failed` for fatal conditions and `Exited` for a subprocess that died
//! while idle (a fresh one is booted with the next task).

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::WorkerOptions;
use crate::errors::{format_stderr_block, CrashReport, PoolError, Result, TaskError};
use crate::process::{attach, ProcessEvent, ProcessLink, ProcessSpawner, StderrBuffer, WorkerEvent};
use crate::protocol::{
    as_task_payload, encode_init, encode_message, render, render_all, InitResponse, JsonFramer,
    TaskResponse,
};
use crate::types::{ExitInfo, WorkerId};

use super::task::{task_channel, PendingTask, TaskFuture, TaskReply};

/// Externally visible worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for the handshake response.
    Initializing,
    Ready,
    /// A task is in flight.
    Busy,
    /// The subprocess went away while idle; the next task boots a new one.
    Exited,
    /// Destroy requested; waiting for outstanding work or for the exit.
    Destroying,
    Destroyed,
    Failed,
}

/// Something the owner of a worker needs to react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    /// The handshake completed.
    Initialized,
    /// The pending task was settled; the worker can take another one.
    Settled,
    /// The subprocess is gone for good after a destroy request.
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initializing,
    Ready,
    Exited,
    Terminating,
    Terminated,
    Failed,
}

pub struct Worker {
    id: WorkerId,
    name: String,
    options: Arc<WorkerOptions>,
    spawner: Arc<dyn ProcessSpawner>,
    events: mpsc::Sender<WorkerEvent>,
    process: Option<ProcessLink>,
    generation: u64,
    framer: JsonFramer,
    stderr: StderrBuffer,
    phase: Phase,
    pending: Option<PendingTask>,
    destroy_requested: bool,
    destroy_waiters: Vec<oneshot::Sender<()>>,
    failure: Option<String>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("phase", &self.phase)
            .field("busy", &self.pending.is_some())
            .field("destroy_requested", &self.destroy_requested)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Spawn the first subprocess and send it the handshake.
    ///
    /// Subprocess output is delivered as [`WorkerEvent`]s on `events`; the
    /// caller must route them back into [`Worker::handle_event`].
    pub fn boot(
        id: WorkerId,
        name: impl Into<String>,
        options: Arc<WorkerOptions>,
        spawner: Arc<dyn ProcessSpawner>,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Result<Self> {
        let stderr = StderrBuffer::new(options.stderr_limit);
        let mut worker = Self {
            id,
            name: name.into(),
            options,
            spawner,
            events,
            process: None,
            generation: 0,
            framer: JsonFramer::new(),
            stderr,
            phase: Phase::Initializing,
            pending: None,
            destroy_requested: false,
            destroy_waiters: Vec::new(),
            failure: None,
        };
        worker.spawn_process()?;
        Ok(worker)
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessLink::pid)
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        matches!(self.phase, Phase::Terminated | Phase::Failed)
    }

    pub fn state(&self) -> WorkerState {
        match self.phase {
            Phase::Failed => WorkerState::Failed,
            Phase::Terminated => WorkerState::Destroyed,
            Phase::Terminating => WorkerState::Destroying,
            _ if self.destroy_requested => WorkerState::Destroying,
            Phase::Initializing => WorkerState::Initializing,
            Phase::Exited => WorkerState::Exited,
            Phase::Ready if self.pending.is_some() => WorkerState::Busy,
            Phase::Ready => WorkerState::Ready,
        }
    }

    /// Submit a task and get a future for its result.
    ///
    /// Usage errors (destroyed, busy, non-object payload) are returned right
    /// away and leave any in-flight task untouched.
    pub fn send_message(&mut self, payload: Value) -> Result<TaskFuture> {
        let (reply, future) = task_channel();
        self.dispatch(payload, reply)?;
        Ok(future)
    }

    /// Like [`Worker::send_message`], settling an existing reply instead of
    /// creating a new one. On error the reply is rejected before returning.
    pub fn dispatch(&mut self, payload: Value, reply: TaskReply) -> Result<()> {
        if let Err(err) = self.check_accepts(&payload) {
            reply.reject(TaskError::Terminated(err.to_string()));
            return Err(err);
        }

        self.pending = Some(PendingTask::new(
            payload,
            reply,
            self.options.max_reboots_per_task,
        ));

        match self.phase {
            Phase::Ready => self.write_pending(),
            Phase::Exited => {
                debug!(worker = %self.name, "booting a fresh process for the next task");
                if let Err(err) = self.spawn_process() {
                    return Err(self.fail(err));
                }
            }
            // Written once the handshake succeeds.
            _ => debug!(worker = %self.name, "task deferred until initialization completes"),
        }
        Ok(())
    }

    /// React to one event from a subprocess.
    ///
    /// An `Err` is a fatal condition of this worker (failed handshake, or a
    /// protocol violation with no task to pin it on). The worker is `Failed`
    /// afterwards and any waiting task has been rejected.
    pub fn handle_event(&mut self, event: WorkerEvent) -> Result<Option<WorkerStep>> {
        if event.worker != self.id || event.generation != self.generation {
            debug!(
                worker = %self.name,
                generation = event.generation,
                current = self.generation,
                "ignoring event from a replaced process"
            );
            return Ok(None);
        }

        match event.kind {
            ProcessEvent::Stderr(bytes) => {
                self.on_stderr(&bytes);
                Ok(None)
            }
            ProcessEvent::Stdout(bytes) => self.on_stdout(bytes),
            ProcessEvent::Exited(exit) => self.on_exit(exit),
        }
    }

    /// Stop accepting tasks; terminate the subprocess once the outstanding
    /// task (or handshake) has settled. `done` fires when that happened.
    pub fn destroy(&mut self, done: Option<oneshot::Sender<()>>) {
        self.destroy_requested = true;
        if let Some(done) = done {
            self.destroy_waiters.push(done);
        }

        match self.phase {
            Phase::Terminated | Phase::Failed => self.notify_destroyed(),
            Phase::Exited => {
                self.process = None;
                self.phase = Phase::Terminated;
                self.notify_destroyed();
            }
            Phase::Terminating => {}
            Phase::Ready if self.pending.is_none() => self.terminate(),
            Phase::Ready | Phase::Initializing => {
                debug!(worker = %self.name, "destroy requested; waiting for outstanding work");
            }
        }
    }

    /// Terminate right away, rejecting the in-flight task (if any).
    pub fn abort(&mut self, reason: &str) {
        if let Some(task) = self.pending.take() {
            task.reply.reject(TaskError::Terminated(reason.to_string()));
        }
        self.destroy_requested = true;
        if !matches!(self.phase, Phase::Terminating | Phase::Terminated | Phase::Failed) {
            self.terminate();
        }
    }

    fn check_accepts(&self, payload: &Value) -> Result<()> {
        if let Some(reason) = &self.failure {
            return Err(PoolError::Terminated(format!("{} failed: {reason}", self.name)));
        }
        if self.destroy_requested
            || matches!(self.phase, Phase::Terminating | Phase::Terminated)
        {
            return Err(PoolError::WorkerDestroyed);
        }
        if self.pending.is_some() {
            return Err(PoolError::WorkerBusy);
        }
        if as_task_payload(payload).is_none() {
            return Err(PoolError::InvalidPayload(render(payload)));
        }
        Ok(())
    }

    fn spawn_process(&mut self) -> Result<()> {
        let process = self
            .spawner
            .spawn(&self.options.spawn)
            .map_err(|e| PoolError::Initialization {
                worker: self.id,
                reason: format!(
                    "failed to spawn '{}': {e}",
                    self.options.spawn.program.display()
                ),
            })?;

        self.generation += 1;
        self.framer.reset();
        self.stderr = StderrBuffer::new(self.options.stderr_limit);

        let link = attach(
            process,
            self.id,
            self.generation,
            self.events.clone(),
            self.options.forward_stderr,
        );
        link.write(encode_init(&self.options.init_data));
        info!(
            worker = %self.name,
            generation = self.generation,
            pid = ?link.pid(),
            "worker process booted; handshake sent"
        );

        self.process = Some(link);
        self.phase = Phase::Initializing;
        Ok(())
    }

    fn write_pending(&mut self) {
        let (Some(task), Some(link)) = (self.pending.as_ref(), self.process.as_ref()) else {
            return;
        };
        if !link.write(encode_message(&task.payload)) {
            // The exit event that follows decides what happens to the task.
            warn!(worker = %self.name, "worker stdin already closed; task not written");
        }
        debug!(worker = %self.name, generation = self.generation, "task written to worker");
    }

    fn on_stderr(&mut self, bytes: &[u8]) {
        self.stderr.push(bytes);
    }

    fn on_stdout(&mut self, bytes: Vec<u8>) -> Result<Option<WorkerStep>> {
        if !matches!(self.phase, Phase::Initializing | Phase::Ready) {
            debug!(worker = %self.name, "ignoring output from a process being shut down");
            return Ok(None);
        }

        let mut values = match self.framer.parse(&bytes) {
            Ok(values) => values,
            Err(e) => return self.protocol_violation(e.to_string()),
        };

        // Whitespace between messages is fine at any time; anything else
        // while idle is not.
        let idle = self.phase == Phase::Ready && self.pending.is_none();
        let meaningful = bytes.iter().any(|b| !b.is_ascii_whitespace());
        if idle && (meaningful || self.framer.is_mid_value()) {
            let reason = format!(
                "Received unexpected data from child process: {}",
                String::from_utf8_lossy(&bytes)
            );
            return Err(self.fail(PoolError::ProtocolViolation {
                worker: self.id,
                reason,
            }));
        }

        if values.is_empty() {
            return Ok(None);
        }

        if self.options.print_child_responses {
            let pretty = serde_json::to_string_pretty(&values).unwrap_or_else(|_| render_all(&values));
            info!(worker = %self.name, responses = %pretty, "worker responses");
        }

        if values.len() > 1 {
            return self.protocol_violation(format!(
                "Received multiple responses when we were only expecting one: {}",
                render_all(&values)
            ));
        }

        let value = values.remove(0);
        if self.phase == Phase::Initializing {
            self.on_init_response(value)
        } else {
            Ok(self.on_task_response(value))
        }
    }

    fn on_init_response(&mut self, value: Value) -> Result<Option<WorkerStep>> {
        match InitResponse::classify(value) {
            InitResponse::Success => {
                self.phase = Phase::Ready;
                info!(worker = %self.name, generation = self.generation, "worker initialized");
                if self.pending.is_some() {
                    self.write_pending();
                } else if self.destroy_requested {
                    self.terminate();
                }
                Ok(Some(WorkerStep::Initialized))
            }
            InitResponse::Error(err) => {
                let reason = match err {
                    Value::String(s) => s,
                    other => render(&other),
                };
                Err(self.fail(PoolError::Initialization {
                    worker: self.id,
                    reason,
                }))
            }
            InitResponse::Invalid(v) => Err(self.fail(PoolError::Initialization {
                worker: self.id,
                reason: format!("Invalid initialization response received: {}", render(&v)),
            })),
        }
    }

    fn on_task_response(&mut self, value: Value) -> Option<WorkerStep> {
        let Some(task) = self.pending.take() else {
            return None;
        };

        match TaskResponse::classify(value) {
            TaskResponse::Response(v) => task.reply.resolve(v),
            TaskResponse::Error(e) => task.reply.reject(TaskError::Worker(e)),
            TaskResponse::Malformed(v) => {
                warn!(worker = %self.name, payload = %render(&v), "worker sent a malformed response");
                task.reply.reject(TaskError::Protocol(format!(
                    "Confusing child response message: {}",
                    render(&v)
                )));
            }
        }
        Some(self.settled())
    }

    /// Report a protocol violation against whatever is outstanding.
    fn protocol_violation(&mut self, reason: String) -> Result<Option<WorkerStep>> {
        if self.phase == Phase::Initializing {
            return Err(self.fail(PoolError::Initialization {
                worker: self.id,
                reason,
            }));
        }

        match self.pending.take() {
            Some(task) => {
                warn!(worker = %self.name, %reason, "protocol violation; rejecting task");
                task.reply.reject(TaskError::Protocol(reason));
                Ok(Some(self.settled()))
            }
            None => Err(self.fail(PoolError::ProtocolViolation {
                worker: self.id,
                reason,
            })),
        }
    }

    fn on_exit(&mut self, exit: ExitInfo) -> Result<Option<WorkerStep>> {
        match self.phase {
            Phase::Terminating => {
                self.process = None;
                self.phase = Phase::Terminated;
                info!(worker = %self.name, %exit, "worker destroyed");
                self.notify_destroyed();
                Ok(Some(WorkerStep::Destroyed))
            }
            Phase::Terminated | Phase::Failed | Phase::Exited => Ok(None),
            Phase::Initializing => {
                // Dying during a reboot's handshake counts against the task
                // that caused the reboot.
                if self.pending.as_ref().is_some_and(|t| t.retries.used() > 0) {
                    return self.on_crash_with_task(exit);
                }
                let reason = format!(
                    "Worker process exited before it could be initialized! {exit}\n{}",
                    format_stderr_block(&self.stderr.render())
                );
                Err(self.fail(PoolError::Initialization {
                    worker: self.id,
                    reason,
                }))
            }
            Phase::Ready if self.pending.is_some() => self.on_crash_with_task(exit),
            Phase::Ready => {
                warn!(
                    worker = %self.name,
                    %exit,
                    "worker process exited while idle; a new one will be booted for the next task"
                );
                self.process = None;
                self.phase = Phase::Exited;
                Ok(None)
            }
        }
    }

    fn on_crash_with_task(&mut self, exit: ExitInfo) -> Result<Option<WorkerStep>> {
        self.process = None;

        let retry = self
            .pending
            .as_mut()
            .is_some_and(|task| task.retries.try_consume());

        if retry {
            warn!(
                worker = %self.name,
                %exit,
                "worker process exited with a task pending; rebooting and retrying"
            );
            if let Err(err) = self.spawn_process() {
                return Err(self.fail(err));
            }
            return Ok(None);
        }

        let report = CrashReport {
            worker: self.id,
            exit,
            stderr: self.stderr.render(),
        };
        error!(worker = %self.name, %exit, "worker process exited again; giving up on task");
        if let Some(task) = self.pending.take() {
            task.reply.reject(TaskError::Crashed(report));
        }
        self.phase = Phase::Exited;
        Ok(Some(self.settled()))
    }

    /// Bookkeeping after the pending task was settled.
    fn settled(&mut self) -> WorkerStep {
        if self.destroy_requested {
            self.terminate();
        }
        WorkerStep::Settled
    }

    fn terminate(&mut self) {
        match self.process.as_mut() {
            Some(link) => {
                debug!(worker = %self.name, generation = self.generation, "terminating worker process");
                link.terminate();
                self.phase = Phase::Terminating;
            }
            None => {
                self.phase = Phase::Terminated;
                self.notify_destroyed();
            }
        }
    }

    fn fail(&mut self, err: PoolError) -> PoolError {
        error!(worker = %self.name, error = %err, "worker failed");
        self.phase = Phase::Failed;
        self.failure = Some(err.to_string());
        if let Some(link) = self.process.as_mut() {
            link.terminate();
        }
        if let Some(task) = self.pending.take() {
            task.reply.reject(task_error_for(&err));
        }
        self.notify_destroyed();
        err
    }

    fn notify_destroyed(&mut self) {
        for done in self.destroy_waiters.drain(..) {
            let _ = done.send(());
        }
    }
}

fn task_error_for(err: &PoolError) -> TaskError {
    match err {
        PoolError::Initialization { .. } => TaskError::Initialization(err.to_string()),
        PoolError::ProtocolViolation { .. } => TaskError::Protocol(err.to_string()),
        other => TaskError::Terminated(other.to_string()),
    }
}
