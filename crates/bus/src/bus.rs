// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topic registry and subscription delivery.

use parking_lot::Mutex;
use replug_core::{EventBody, JobEvent, JobId};
use replug_store::{EventSink, JobStore};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

replug_core::define_id! {
    /// Identifier for one live subscription.
    pub struct SubscriptionId("sub-");
}

/// Bus tunables.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded per-subscription buffer depth.
    pub buffer: usize,
    /// How long an undrained terminal event may sit before the
    /// subscription is closed as a slow consumer.
    pub publish_timeout: Duration,
    /// Advisory per-topic subscription cap (exceeding it only logs).
    pub max_subscriptions: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer: 256,
            publish_timeout: Duration::from_secs(2),
            max_subscriptions: 64,
        }
    }
}

/// Why a subscription stopped yielding events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closed {
    /// The terminal event was delivered; the stream is complete.
    Finished,
    /// The subscriber failed to keep up and was disconnected.
    SlowConsumer,
}

/// Errors from bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("unknown job: {0}")]
    UnknownJob(JobId),
}

struct SubQueue {
    events: std::collections::VecDeque<JobEvent>,
    /// Events dropped since the last gap marker was queued.
    dropped: u32,
    closed: Option<Closed>,
    last_ack: u64,
}

struct SubState {
    id: SubscriptionId,
    job_id: JobId,
    queue: Mutex<SubQueue>,
    notify: Notify,
}

impl SubState {
    /// Push one event, evicting the oldest undelivered non-terminal entries
    /// on overflow. Evictions are summarized by a gap marker kept at the
    /// head of the queue (markers absorb each other when re-evicted).
    fn push(&self, event: &JobEvent, buffer: usize) {
        let mut q = self.queue.lock();
        if q.closed.is_some() {
            return;
        }

        q.events.push_back(event.clone());
        while q.events.len() > buffer {
            match q.events.pop_front() {
                Some(JobEvent { body: EventBody::Gap { dropped }, .. }) => q.dropped += dropped,
                Some(ev) if ev.body.is_terminal() => {
                    // Terminal events are never evicted.
                    q.events.push_front(ev);
                    break;
                }
                Some(_) => q.dropped += 1,
                None => break,
            }
        }

        if q.dropped > 0 {
            if q.events.len() >= buffer {
                // Make room for the marker itself.
                if let Some(ev) = q.events.pop_front() {
                    match ev.body {
                        EventBody::Gap { dropped } => q.dropped += dropped,
                        _ if ev.body.is_terminal() => q.events.push_front(ev),
                        _ => q.dropped += 1,
                    }
                }
            }
            if q.events.len() < buffer {
                let dropped = q.dropped;
                q.events.push_front(JobEvent {
                    job_id: event.job_id,
                    // Gap markers are subscription-local, outside the topic numbering.
                    seq: 0,
                    ts_ms: event.ts_ms,
                    body: EventBody::Gap { dropped },
                });
                q.dropped = 0;
            }
        }
        drop(q);
        self.notify.notify_one();
    }

    fn close(&self, reason: Closed) {
        let mut q = self.queue.lock();
        if q.closed.is_none() {
            q.closed = Some(reason);
        }
        drop(q);
        self.notify.notify_one();
    }

    fn has_undrained_terminal(&self) -> bool {
        let q = self.queue.lock();
        q.closed.is_none() && q.events.iter().any(|e| e.body.is_terminal())
    }
}

struct BusInner {
    store: Arc<JobStore>,
    topics: Mutex<HashMap<JobId, Vec<Arc<SubState>>>>,
    cfg: BusConfig,
}

/// Per-job publish/subscribe fan-out. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus over the given store and attach it as the store's
    /// delivery sink.
    pub fn new(store: Arc<JobStore>, mut cfg: BusConfig) -> Self {
        // Room for at least one event plus a gap marker.
        cfg.buffer = cfg.buffer.max(2);
        let bus = Self {
            inner: Arc::new(BusInner { store, topics: Mutex::new(HashMap::new()), cfg }),
        };
        bus.inner.store.set_sink(Arc::new(bus.clone()));
        bus
    }

    /// Subscribe to a job's event stream, replaying retained events with
    /// `seq > since_seq` before any live delivery.
    pub fn subscribe(&self, job_id: JobId, since_seq: u64) -> Result<Subscription, BusError> {
        if self.inner.store.get(&job_id).is_err() {
            return Err(BusError::UnknownJob(job_id));
        }

        let state = Arc::new(SubState {
            id: SubscriptionId::new(),
            job_id,
            queue: Mutex::new(SubQueue {
                events: std::collections::VecDeque::new(),
                dropped: 0,
                closed: None,
                last_ack: since_seq,
            }),
            notify: Notify::new(),
        });

        // Register first so no publish can slip between the replay
        // snapshot and live delivery.
        {
            let mut topics = self.inner.topics.lock();
            let subs = topics.entry(job_id).or_default();
            subs.push(Arc::clone(&state));
            if subs.len() > self.inner.cfg.max_subscriptions {
                tracing::warn!(
                    %job_id,
                    count = subs.len(),
                    cap = self.inner.cfg.max_subscriptions,
                    "subscription count above advisory cap"
                );
            }
        }

        // Merge the retained tail in front of anything delivered live
        // while we were registering (live entries are a suffix of the
        // snapshot or newer than it).
        let replay = self.inner.store.events_since(&job_id, since_seq);
        {
            let mut q = state.queue.lock();
            let first_live =
                q.events.iter().find(|e| e.seq > 0).map(|e| e.seq).unwrap_or(u64::MAX);
            for event in replay.into_iter().rev() {
                if event.seq < first_live {
                    q.events.push_front(event);
                }
            }
        }
        state.notify.notify_one();

        Ok(Subscription {
            state,
            bus: Arc::downgrade(&self.inner),
            last_delivered: since_seq,
        })
    }

    fn unsubscribe(inner: &BusInner, state: &Arc<SubState>) {
        let mut topics = inner.topics.lock();
        if let Some(subs) = topics.get_mut(&state.job_id) {
            subs.retain(|s| s.id != state.id);
            if subs.is_empty() {
                topics.remove(&state.job_id);
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.inner.topics.lock().get(job_id).map(Vec::len).unwrap_or(0)
    }
}

impl EventSink for EventBus {
    fn deliver(&self, event: &JobEvent) {
        let subs: Vec<Arc<SubState>> = {
            let topics = self.inner.topics.lock();
            match topics.get(&event.job_id) {
                Some(subs) => subs.clone(),
                None => return,
            }
        };

        for sub in subs {
            sub.push(event, self.inner.cfg.buffer);

            // Terminal events must reach the subscriber. Give it one publish
            // timeout to drain, then disconnect it as a slow consumer.
            if event.body.is_terminal() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let timeout = self.inner.cfg.publish_timeout;
                    let sub = Arc::clone(&sub);
                    handle.spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if sub.has_undrained_terminal() {
                            tracing::warn!(id = %sub.id, job_id = %sub.job_id, "closing slow consumer");
                            sub.close(Closed::SlowConsumer);
                        }
                    });
                }
            }
        }
    }
}

/// One live consumer of a job's topic. Dropping it unsubscribes.
pub struct Subscription {
    state: Arc<SubState>,
    bus: Weak<BusInner>,
    last_delivered: u64,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.state.id
    }

    pub fn job_id(&self) -> JobId {
        self.state.job_id
    }

    /// Record an advisory client acknowledgement.
    pub fn ack(&self, seq: u64) {
        let mut q = self.state.queue.lock();
        q.last_ack = q.last_ack.max(seq);
    }

    /// Next event in sequence order, or why the stream ended.
    ///
    /// After the terminal event has been yielded, returns
    /// `Err(Closed::Finished)`.
    pub async fn recv(&mut self) -> Result<JobEvent, Closed> {
        loop {
            {
                let mut q = self.state.queue.lock();
                if q.closed == Some(Closed::SlowConsumer) {
                    return Err(Closed::SlowConsumer);
                }
                while let Some(event) = q.events.pop_front() {
                    // A publish racing subscribe() can duplicate a replayed
                    // event; skip anything at or below the delivery cursor.
                    if event.seq != 0 && event.seq <= self.last_delivered {
                        continue;
                    }
                    if event.seq != 0 {
                        self.last_delivered = event.seq;
                    }
                    if event.body.is_terminal() {
                        q.closed = Some(Closed::Finished);
                    }
                    return Ok(event);
                }
                if let Some(reason) = q.closed {
                    return Err(reason);
                }
            }
            self.state.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            EventBus::unsubscribe(&inner, &self.state);
        }
    }
}

#[cfg(test)]
#[path = "bus_tests.rs"]
mod tests;
