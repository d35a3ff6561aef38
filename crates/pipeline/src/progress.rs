// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Progress and log forwarding with event-volume capping.

use replug_core::{Clock, EventBody, JobId, JobPatch, JobStatus, PluginMeta};
use replug_store::JobStore;
use std::sync::Arc;

/// Per-line truncation for forwarded tool output.
const MAX_LOG_LINE: usize = 500;

/// Per-job cap on forwarded log events.
const MAX_LOG_LINES: usize = 1000;

/// Publishes status/log events for one job attempt.
///
/// Status updates are forwarded only when progress strictly increases or
/// the stage changes; log lines are truncated per line and capped per job.
pub struct Reporter<C: Clock> {
    store: Arc<JobStore>,
    job_id: JobId,
    clock: C,
    last_progress: u8,
    last_stage: String,
    log_lines: usize,
    log_capped: bool,
}

impl<C: Clock> Reporter<C> {
    pub fn new(store: Arc<JobStore>, job_id: JobId, clock: C) -> Self {
        Self {
            store,
            job_id,
            clock,
            last_progress: 0,
            last_stage: String::new(),
            log_lines: 0,
            log_capped: false,
        }
    }

    /// Publish a status tick. No-ops when neither progress nor stage moved.
    pub fn status(
        &mut self,
        status: JobStatus,
        progress: u8,
        stage: &str,
        message: &str,
    ) -> Result<(), replug_store::StoreError> {
        if progress <= self.last_progress && stage == self.last_stage {
            return Ok(());
        }
        self.last_progress = self.last_progress.max(progress);
        self.last_stage = stage.to_string();

        self.store.update(
            &self.job_id,
            JobPatch::new()
                .status(status)
                .progress(progress)
                .stage(stage)
                .message(message),
            self.clock.epoch_ms(),
        )?;
        Ok(())
    }

    /// Forward one line of tool output as a log event.
    pub fn log(&mut self, line: &str) {
        if self.log_capped {
            return;
        }
        if self.log_lines >= MAX_LOG_LINES {
            self.log_capped = true;
            let _ = self.store.publish_event(
                &self.job_id,
                EventBody::Log { line: "... further tool output suppressed".to_string() },
                self.clock.epoch_ms(),
            );
            return;
        }
        self.log_lines += 1;
        let line = truncate(line, MAX_LOG_LINE);
        if let Err(e) = self.store.publish_event(
            &self.job_id,
            EventBody::Log { line },
            self.clock.epoch_ms(),
        ) {
            tracing::debug!(job_id = %self.job_id, %e, "log event dropped");
        }
    }

    /// Attach plugin metadata to the job; the resulting status event
    /// carries it to subscribers.
    pub fn meta(&self, plugin: PluginMeta) -> Result<(), replug_store::StoreError> {
        self.store.update(
            &self.job_id,
            JobPatch::new().plugin(plugin),
            self.clock.epoch_ms(),
        )?;
        Ok(())
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.epoch_ms()
    }
}

/// Truncate to a UTF-8-safe prefix of at most `limit` bytes.
fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
#[path = "progress_tests.rs"]
mod tests;
