// src/pool/scheduler.rs

//! Idle/busy bookkeeping for a pool.
//!
//! Pure data structure: no channels, no Tokio, no workers. The pool actor
//! decides *when* to ask it something; the scheduler only answers *which*
//! worker or *which* queued item comes next. Generic over the queued item so
//! it can be exercised with plain values in tests.
//!
//! Two kinds of queues:
//! - the global FIFO, for tasks any worker may run;
//! - one FIFO per worker, for broadcast copies that must run on that
//!   particular worker. A freed worker drains its own queue before taking
//!   from the global one.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::types::WorkerId;

#[derive(Debug)]
pub struct Scheduler<T> {
    idle: VecDeque<WorkerId>,
    queue: VecDeque<T>,
    direct: HashMap<WorkerId, VecDeque<T>>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            direct: HashMap::new(),
        }
    }

    /// Register a worker as available (freshly booted).
    pub fn add_idle(&mut self, worker: WorkerId) {
        if !self.idle.contains(&worker) {
            self.idle.push_back(worker);
        }
    }

    /// Take any idle worker.
    pub fn take_idle(&mut self) -> Option<WorkerId> {
        self.idle.pop_front()
    }

    /// Take this particular worker out of the idle list. Returns `false` if
    /// it was not idle.
    pub fn claim_idle(&mut self, worker: WorkerId) -> bool {
        match self.idle.iter().position(|w| *w == worker) {
            Some(pos) => {
                self.idle.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn is_idle(&self, worker: WorkerId) -> bool {
        self.idle.contains(&worker)
    }

    /// Queue an item for whichever worker frees up first.
    pub fn enqueue(&mut self, item: T) {
        self.queue.push_back(item);
        debug!(queued = self.queue.len(), "all workers busy; task queued");
    }

    /// Queue an item that must run on `worker`.
    pub fn enqueue_for(&mut self, worker: WorkerId, item: T) {
        let q = self.direct.entry(worker).or_default();
        q.push_back(item);
        debug!(worker = %worker, queued = q.len(), "worker busy; broadcast copy queued");
    }

    /// `worker` just finished a task. Returns what it should run next; if
    /// there is nothing, the worker is put back on the idle list.
    pub fn next_for(&mut self, worker: WorkerId) -> Option<T> {
        if let Some(q) = self.direct.get_mut(&worker) {
            let item = q.pop_front();
            if q.is_empty() {
                self.direct.remove(&worker);
            }
            if item.is_some() {
                return item;
            }
        }

        if let Some(item) = self.queue.pop_front() {
            return Some(item);
        }

        self.add_idle(worker);
        None
    }

    /// Forget a worker. Returns the items that were queued for it alone.
    pub fn remove_worker(&mut self, worker: WorkerId) -> Vec<T> {
        self.idle.retain(|w| *w != worker);
        self.direct
            .remove(&worker)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Empty the global queue.
    pub fn drain_queue(&mut self) -> Vec<T> {
        self.queue.drain(..).collect()
    }

    /// Empty every queue, global and per-worker.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut items: Vec<T> = self.queue.drain(..).collect();
        for (_, q) in self.direct.drain() {
            items.extend(q);
        }
        items
    }

    pub fn idle_len(&self) -> usize {
        self.idle.len()
    }

    /// Items in the global queue.
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// Items in all per-worker queues.
    pub fn direct_len(&self) -> usize {
        self.direct.values().map(VecDeque::len).sum()
    }

    pub fn has_queued_work(&self) -> bool {
        !self.queue.is_empty() || !self.direct.is_empty()
    }
}
