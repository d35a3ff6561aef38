// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process FIFO work queue with exclusive claims.

use parking_lot::Mutex;
use replug_core::JobId;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Broker tunables.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Queue depth above which new work is refused at admission.
    pub high_water: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { high_water: 100 }
    }
}

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("queue is full ({depth} jobs)")]
    Overloaded { depth: usize },

    #[error("job {0} is already queued or claimed")]
    AlreadyQueued(JobId),

    #[error("queue is shut down")]
    Closed,
}

struct BrokerState {
    queue: VecDeque<JobId>,
    queued: HashSet<JobId>,
    claimed: HashSet<JobId>,
    closed: bool,
}

/// FIFO claim queue shared by the controller and the worker pool.
#[derive(Clone)]
pub struct Broker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    cfg: BrokerConfig,
}

impl Broker {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                claimed: HashSet::new(),
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
            cfg,
        }
    }

    /// Queue a job id. A job may be enqueued only once while it is queued
    /// or claimed.
    pub fn enqueue(&self, id: JobId) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.queued.contains(&id) || state.claimed.contains(&id) {
            return Err(BrokerError::AlreadyQueued(id));
        }
        if state.queue.len() >= self.cfg.high_water {
            return Err(BrokerError::Overloaded { depth: state.queue.len() });
        }
        state.queue.push_back(id);
        state.queued.insert(id);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Whether admission should refuse new work.
    pub fn is_saturated(&self) -> bool {
        self.state.lock().queue.len() >= self.cfg.high_water
    }

    pub fn depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Claim the next queued job. Resolves to `None` once the broker is
    /// closed and drained.
    pub async fn claim(&self) -> Option<JobId> {
        loop {
            // Register interest before checking state so a close() or
            // enqueue() racing this check cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some(id) = state.queue.pop_front() {
                    state.queued.remove(&id);
                    state.claimed.insert(id);
                    return Some(id);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Release a claim after the job was handled (success or a failure the
    /// worker already recorded).
    pub fn ack(&self, id: &JobId) {
        self.state.lock().claimed.remove(id);
    }

    /// Release a claim and requeue the job (the worker never got to run
    /// it, e.g. shutdown raced the claim).
    pub fn nack(&self, id: &JobId) {
        let mut state = self.state.lock();
        state.claimed.remove(id);
        if !state.closed && state.queued.insert(*id) {
            state.queue.push_back(*id);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Stop handing out claims; pending entries are dropped and waiting
    /// workers wake with `None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.queue.clear();
        state.queued.clear();
        drop(state);
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
