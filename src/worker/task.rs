// src/worker/task.rs

//! Task records and their settlement.
//!
//! A task's result travels through a oneshot channel: the submitter keeps the
//! [`TaskFuture`], the worker keeps the [`TaskReply`] inside its pending
//! task record. `TaskReply::settle` consumes the reply, so a task can only be
//! settled once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::errors::TaskError;

pub type TaskResult = std::result::Result<Value, TaskError>;

/// Create a linked reply/future pair for one task.
pub fn task_channel() -> (TaskReply, TaskFuture) {
    let (tx, rx) = oneshot::channel();
    (TaskReply { tx }, TaskFuture { rx })
}

/// Write side of a task's result.
#[derive(Debug)]
pub struct TaskReply {
    tx: oneshot::Sender<TaskResult>,
}

impl TaskReply {
    pub fn settle(self, result: TaskResult) {
        if self.tx.send(result).is_err() {
            debug!("task result dropped: submitter no longer waiting");
        }
    }

    pub fn resolve(self, value: Value) {
        self.settle(Ok(value));
    }

    pub fn reject(self, err: TaskError) {
        self.settle(Err(err));
    }
}

/// Resolves to the task's result once the worker settles it.
#[derive(Debug)]
pub struct TaskFuture {
    rx: oneshot::Receiver<TaskResult>,
}

impl Future for TaskFuture {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Terminated(
                "the worker dropped the task without settling it".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded number of subprocess reboots spent on one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    used: u32,
    max: u32,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { used: 0, max }
    }

    /// Spend one reboot if any are left.
    pub fn try_consume(&mut self) -> bool {
        if self.used < self.max {
            self.used += 1;
            true
        } else {
            false
        }
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

/// The single in-flight task of a worker.
#[derive(Debug)]
pub struct PendingTask {
    pub payload: Value,
    pub reply: TaskReply,
    pub retries: RetryBudget,
}

impl PendingTask {
    pub fn new(payload: Value, reply: TaskReply, max_reboots: u32) -> Self {
        Self {
            payload,
            reply,
            retries: RetryBudget::new(max_reboots),
        }
    }
}
