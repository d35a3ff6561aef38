// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Keyed job state with compare-and-set transitions and event retention.

use crate::journal::{Journal, JournalEntry, DEFAULT_ROTATE_BYTES};
use parking_lot::{Mutex, RwLock};
use replug_core::{
    ErrorCode, EventBody, Job, JobEvent, JobId, JobPatch, JobStatus, Origin, OutputInfo,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Live event delivery target (the bus). The store persists and sequences
/// events; the sink fans them out to subscribers.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &JobEvent);
}

/// Store tunables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long job records survive before tombstoning.
    pub job_ttl: Duration,
    /// Retained events per topic.
    pub event_retention: usize,
    /// Journal size that triggers compaction.
    pub journal_rotate_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            job_ttl: Duration::from_secs(24 * 60 * 60),
            event_retention: 256,
            journal_rotate_bytes: DEFAULT_ROTATE_BYTES,
        }
    }
}

/// Errors surfaced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal transition: {from} -> {to}")]
    InvalidState { from: JobStatus, to: JobStatus },

    #[error("event stream for {0} already terminated")]
    Terminated(JobId),

    #[error("journal I/O: {0}")]
    Journal(#[from] std::io::Error),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            StoreError::InvalidState { .. } | StoreError::Terminated(_) => ErrorCode::InvalidState,
            StoreError::Journal(_) => ErrorCode::InternalError,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was still queued; the store transitioned it directly.
    Cancelled,
    /// A worker owns the job; its cancellation token has been triggered and
    /// the worker will perform the terminal transition.
    Signalled,
}

struct TopicState {
    next_seq: u64,
    events: VecDeque<JobEvent>,
    terminated: bool,
}

impl TopicState {
    fn new() -> Self {
        Self { next_seq: 1, events: VecDeque::new(), terminated: false }
    }
}

struct StoreInner {
    jobs: HashMap<JobId, Job>,
    topics: HashMap<JobId, TopicState>,
    cancels: HashMap<JobId, CancellationToken>,
    journal: Journal,
}

/// Durable key/value job state with a recency index and per-topic event
/// retention. One instance per process.
pub struct JobStore {
    inner: Mutex<StoreInner>,
    sink: RwLock<Option<Arc<dyn EventSink>>>,
    cfg: StoreConfig,
}

impl JobStore {
    /// Open the store, replaying the journal under `dir`.
    ///
    /// Records whose TTL elapsed while the process was down replay directly
    /// as tombstones (their event streams are dropped).
    pub fn open(dir: &Path, cfg: StoreConfig, now_ms: u64) -> Result<Self, StoreError> {
        let (journal, entries) = Journal::open(dir, cfg.journal_rotate_bytes)?;

        let mut jobs: HashMap<JobId, Job> = HashMap::new();
        let mut topics: HashMap<JobId, TopicState> = HashMap::new();
        for entry in entries {
            match entry {
                JournalEntry::Job { job } => {
                    jobs.insert(job.id, job);
                }
                JournalEntry::Event { event } => {
                    let topic = topics.entry(event.job_id).or_insert_with(TopicState::new);
                    topic.next_seq = topic.next_seq.max(event.seq + 1);
                    topic.terminated |= event.body.is_terminal();
                    topic.events.push_back(event);
                    while topic.events.len() > cfg.event_retention {
                        topic.events.pop_front();
                    }
                }
            }
        }

        let ttl_ms = cfg.job_ttl.as_millis() as u64;
        let mut expired = 0usize;
        for job in jobs.values_mut() {
            let basis = job.completed_at_ms.unwrap_or(job.created_at_ms);
            if !job.tombstone && job.is_terminal() && now_ms.saturating_sub(basis) >= ttl_ms {
                *job = job.clone().into_tombstone();
                expired += 1;
            }
        }
        topics.retain(|id, _| jobs.get(id).is_some_and(|j| !j.tombstone));

        tracing::info!(jobs = jobs.len(), expired, "job store opened");
        let inner = StoreInner { jobs, topics, cancels: HashMap::new(), journal };
        Ok(Self { inner: Mutex::new(inner), sink: RwLock::new(None), cfg })
    }

    /// Attach the live delivery sink (the event bus). Events accepted before
    /// a sink is attached are retained but not fanned out.
    pub fn set_sink(&self, sink: Arc<dyn EventSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Create a new pending job.
    pub fn create(
        &self,
        origin: Origin,
        platform: Option<String>,
        suffix: String,
        now_ms: u64,
    ) -> Result<Job, StoreError> {
        origin.validate().map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        if !replug_core::validate_suffix(&suffix) {
            return Err(StoreError::InvalidArgument(format!("invalid suffix {suffix:?}")));
        }

        let job = Job::new(origin, platform, suffix, now_ms);
        let mut inner = self.inner.lock();
        inner.journal.append(&JournalEntry::Job { job: job.clone() })?;
        inner.jobs.insert(job.id, job.clone());
        inner.topics.insert(job.id, TopicState::new());
        tracing::info!(id = %job.id, origin = %job.origin, "job created");
        Ok(job)
    }

    /// Current snapshot of a job.
    pub fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        self.inner.lock().jobs.get(id).cloned().ok_or(StoreError::NotFound(*id))
    }

    /// Apply an additive patch. Status changes are compare-and-set against
    /// the state machine; each successful update publishes a status (or
    /// terminal) event before returning.
    pub fn update(&self, id: &JobId, patch: JobPatch, now_ms: u64) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if job.tombstone {
            return Err(StoreError::Terminated(*id));
        }
        if let Some(next) = patch.status {
            if !job.status.accepts(next) {
                return Err(StoreError::InvalidState { from: job.status, to: next });
            }
        }

        job.apply(&patch, now_ms);
        let job = job.clone();

        let body = if job.is_terminal() {
            EventBody::Terminal {
                status: job.status,
                error_code: job.error_code,
                error: job.error.clone(),
                output: job.output.clone(),
            }
        } else {
            EventBody::Status {
                status: job.status,
                progress: job.progress,
                stage: job.stage.clone(),
                message: job.message.clone(),
                plugin: job.plugin.clone(),
            }
        };

        inner.journal.append(&JournalEntry::Job { job: job.clone() })?;
        let event = Self::sequence_event(&mut inner, &self.cfg, *id, body, now_ms)?;
        if job.is_terminal() {
            if let Some(token) = inner.cancels.remove(id) {
                token.cancel();
            }
        }
        self.compact_if_needed(&mut inner);

        // Fan out while still holding the lock so subscribers observe
        // events in sequence order even across racing writers.
        self.fan_out(&event);
        Ok(job)
    }

    /// Append a non-status event (log line, metadata, ...) to the job's
    /// topic and deliver it.
    pub fn publish_event(
        &self,
        id: &JobId,
        body: EventBody,
        now_ms: u64,
    ) -> Result<JobEvent, StoreError> {
        let mut inner = self.inner.lock();
        match inner.jobs.get(id) {
            None => return Err(StoreError::NotFound(*id)),
            // Tombstones dropped their topic; reviving it would restart
            // the sequence numbering.
            Some(job) if job.tombstone => return Err(StoreError::Terminated(*id)),
            Some(_) => {}
        }
        let event = Self::sequence_event(&mut inner, &self.cfg, *id, body, now_ms)?;
        self.fan_out(&event);
        Ok(event)
    }

    fn sequence_event(
        inner: &mut StoreInner,
        cfg: &StoreConfig,
        id: JobId,
        body: EventBody,
        now_ms: u64,
    ) -> Result<JobEvent, StoreError> {
        let topic = inner.topics.entry(id).or_insert_with(TopicState::new);
        if topic.terminated {
            return Err(StoreError::Terminated(id));
        }
        let event = JobEvent { job_id: id, seq: topic.next_seq, ts_ms: now_ms, body };
        topic.next_seq += 1;
        topic.terminated = event.body.is_terminal();
        topic.events.push_back(event.clone());
        while topic.events.len() > cfg.event_retention {
            topic.events.pop_front();
        }
        inner.journal.append(&JournalEntry::Event { event: event.clone() })?;
        Ok(event)
    }

    fn fan_out(&self, event: &JobEvent) {
        if let Some(sink) = self.sink.read().clone() {
            sink.deliver(event);
        }
    }

    /// Retained events with `seq > since_seq`, in order.
    pub fn events_since(&self, id: &JobId, since_seq: u64) -> Vec<JobEvent> {
        let inner = self.inner.lock();
        inner
            .topics
            .get(id)
            .map(|t| t.events.iter().filter(|e| e.seq > since_seq).cloned().collect())
            .unwrap_or_default()
    }

    /// Jobs ordered by `completed_at desc, created_at desc`.
    pub fn list_recent(&self, limit: usize) -> Vec<Job> {
        self.sorted(limit, |_| true)
    }

    /// Completed jobs only, same ordering.
    pub fn list_completed(&self, limit: usize) -> Vec<Job> {
        self.sorted(limit, |j| j.status == JobStatus::Completed && !j.tombstone)
    }

    fn sorted(&self, limit: usize, keep: impl Fn(&Job) -> bool) -> Vec<Job> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner.jobs.values().filter(|j| keep(j)).cloned().collect();
        jobs.sort_by(|a, b| {
            b.completed_at_ms
                .cmp(&a.completed_at_ms)
                .then(b.created_at_ms.cmp(&a.created_at_ms))
        });
        jobs.truncate(limit);
        jobs
    }

    /// Per-job cancellation handle (created on first use).
    pub fn cancel_token(&self, id: &JobId) -> CancellationToken {
        self.inner.lock().cancels.entry(*id).or_default().clone()
    }

    /// Cancel a job: queued jobs transition directly, running jobs have
    /// their cancellation token triggered so the owning worker stops and
    /// performs the transition itself.
    pub fn cancel(&self, id: &JobId, now_ms: u64) -> Result<CancelOutcome, StoreError> {
        let status = self.get(id)?.status;
        if status.is_terminal() {
            return Err(StoreError::InvalidState { from: status, to: JobStatus::Cancelled });
        }
        if status == JobStatus::Pending {
            self.update(
                id,
                JobPatch::new().status(JobStatus::Cancelled).message("cancelled"),
                now_ms,
            )?;
            Ok(CancelOutcome::Cancelled)
        } else {
            self.cancel_token(id).cancel();
            tracing::info!(%id, "cancellation signalled to worker");
            Ok(CancelOutcome::Signalled)
        }
    }

    /// Drop the output descriptor after the artifact reaper removed the
    /// file. The job record itself stays.
    pub fn clear_output(&self, id: &JobId, now_ms: u64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        if job.output.is_none() {
            return Ok(());
        }
        job.output = None;
        job.updated_at_ms = now_ms;
        let job = job.clone();
        inner.journal.append(&JournalEntry::Job { job })?;
        Ok(())
    }

    /// Tombstone records past the job TTL. Returns the affected ids.
    pub fn expire(&self, now_ms: u64) -> Result<Vec<(JobId, Option<OutputInfo>)>, StoreError> {
        let ttl_ms = self.cfg.job_ttl.as_millis() as u64;
        let mut inner = self.inner.lock();
        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| {
                !j.tombstone
                    && j.is_terminal()
                    && now_ms.saturating_sub(j.completed_at_ms.unwrap_or(j.created_at_ms))
                        >= ttl_ms
            })
            .map(|j| j.id)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(job) = inner.jobs.remove(&id) {
                let output = job.output.clone();
                let tomb = job.into_tombstone();
                inner.journal.append(&JournalEntry::Job { job: tomb.clone() })?;
                inner.jobs.insert(id, tomb);
                inner.topics.remove(&id);
                inner.cancels.remove(&id);
                out.push((id, output));
            }
        }
        if !out.is_empty() {
            tracing::info!(count = out.len(), "expired job records to tombstones");
        }
        self.compact_if_needed(&mut inner);
        Ok(out)
    }

    /// Ids of jobs still pending (used by startup re-enqueue) and of jobs
    /// that were mid-flight when the process died.
    pub fn non_terminal_ids(&self) -> Vec<(JobId, JobStatus)> {
        let inner = self.inner.lock();
        inner
            .jobs
            .values()
            .filter(|j| !j.is_terminal())
            .map(|j| (j.id, j.status))
            .collect()
    }

    /// All jobs holding a live output descriptor (for artifact restore).
    pub fn jobs_with_output(&self) -> Vec<Job> {
        let inner = self.inner.lock();
        inner.jobs.values().filter(|j| j.output.is_some()).cloned().collect()
    }

    fn compact_if_needed(&self, inner: &mut StoreInner) {
        if !inner.journal.wants_compaction() {
            return;
        }
        let entries: Vec<JournalEntry> = inner
            .jobs
            .values()
            .map(|job| JournalEntry::Job { job: job.clone() })
            .chain(inner.topics.values().flat_map(|t| {
                t.events.iter().map(|event| JournalEntry::Event { event: event.clone() })
            }))
            .collect();
        if let Err(e) = inner.journal.compact(entries.into_iter()) {
            tracing::error!(%e, "journal compaction failed");
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
