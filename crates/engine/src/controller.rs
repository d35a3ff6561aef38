// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Admission surface: validate, create, enqueue, and read back jobs.

use crate::broker::{Broker, BrokerError};
use replug_artifacts::{ArtifactError, ArtifactStore};
use replug_core::{
    validate_suffix, Clock, ErrorCode, Job, JobId, JobPatch, JobStatus, Origin, DEFAULT_SUFFIX,
};
use replug_store::{CancelOutcome, JobStore, StoreError};
use std::sync::Arc;

/// Platform tags accepted by default (the packaging tool's
/// `--platform` values this service is known to serve).
pub const DEFAULT_PLATFORMS: &[&str] = &[
    "manylinux2014_x86_64",
    "manylinux2014_aarch64",
    "manylinux_2_17_x86_64",
    "manylinux_2_17_aarch64",
    "manylinux_2_28_x86_64",
    "manylinux_2_28_aarch64",
    "macosx_10_9_x86_64",
    "macosx_11_0_arm64",
    "win_amd64",
];

/// Controller tunables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Closed allowlist of target platform tags.
    pub platforms: Vec<String>,
    /// Maximum accepted upload size in bytes.
    pub upload_size_cap: u64,
    /// Hard ceiling for list queries.
    pub list_limit_max: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            platforms: DEFAULT_PLATFORMS.iter().map(|s| s.to_string()).collect(),
            upload_size_cap: 500 * 1024 * 1024,
            list_limit_max: 100,
        }
    }
}

/// Classified admission/read error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ControllerError {
    pub code: ErrorCode,
    pub message: String,
}

impl ControllerError {
    fn invalid(message: impl Into<String>) -> Self {
        Self { code: ErrorCode::InvalidArgument, message: message.into() }
    }

    fn overloaded(message: impl Into<String>) -> Self {
        Self { code: ErrorCode::Overloaded, message: message.into() }
    }
}

impl From<StoreError> for ControllerError {
    fn from(e: StoreError) -> Self {
        Self { code: e.code(), message: e.to_string() }
    }
}

impl From<ArtifactError> for ControllerError {
    fn from(e: ArtifactError) -> Self {
        let code = match &e {
            ArtifactError::NotFound(_) | ArtifactError::Expired(_) => ErrorCode::NotFound,
            ArtifactError::Exhausted { .. } => ErrorCode::Overloaded,
            ArtifactError::Unsafe(_) => ErrorCode::InvalidArgument,
            ArtifactError::Io(_) => ErrorCode::InternalError,
        };
        Self { code, message: e.to_string() }
    }
}

/// The admission surface in front of the store, broker, and artifacts.
pub struct Controller<C: Clock> {
    store: Arc<JobStore>,
    artifacts: Arc<ArtifactStore>,
    broker: Broker,
    cfg: ControllerConfig,
    clock: C,
}

impl<C: Clock> Controller<C> {
    pub fn new(
        store: Arc<JobStore>,
        artifacts: Arc<ArtifactStore>,
        broker: Broker,
        cfg: ControllerConfig,
        clock: C,
    ) -> Self {
        Self { store, artifacts, broker, cfg, clock }
    }

    /// Create a job downloading from a direct URL.
    pub async fn create_url(
        &self,
        url: String,
        platform: Option<String>,
        suffix: Option<String>,
    ) -> Result<Job, ControllerError> {
        self.admit(Origin::Url { url }, platform, suffix, None).await
    }

    /// Create a job for a marketplace coordinate.
    pub async fn create_marketplace(
        &self,
        author: String,
        name: String,
        version: String,
        platform: Option<String>,
        suffix: Option<String>,
    ) -> Result<Job, ControllerError> {
        self.admit(Origin::Marketplace { author, name, version }, platform, suffix, None).await
    }

    /// Create a job from an uploaded package.
    pub async fn create_upload(
        &self,
        filename: String,
        bytes: Vec<u8>,
        platform: Option<String>,
        suffix: Option<String>,
    ) -> Result<Job, ControllerError> {
        if bytes.len() as u64 > self.cfg.upload_size_cap {
            return Err(ControllerError::invalid(format!(
                "upload exceeds size cap of {} bytes",
                self.cfg.upload_size_cap
            )));
        }
        self.admit(Origin::Upload { filename }, platform, suffix, Some(bytes)).await
    }

    async fn admit(
        &self,
        origin: Origin,
        platform: Option<String>,
        suffix: Option<String>,
        upload: Option<Vec<u8>>,
    ) -> Result<Job, ControllerError> {
        origin.validate().map_err(|e| ControllerError::invalid(e.to_string()))?;

        let platform = platform.filter(|p| !p.is_empty());
        if let Some(ref tag) = platform {
            if !self.cfg.platforms.iter().any(|p| p == tag) {
                return Err(ControllerError::invalid(format!(
                    "platform {tag:?} is not in the allowlist"
                )));
            }
        }

        let suffix = suffix.filter(|s| !s.is_empty()).unwrap_or_else(|| DEFAULT_SUFFIX.to_string());
        if !validate_suffix(&suffix) {
            return Err(ControllerError::invalid(format!("invalid suffix {suffix:?}")));
        }

        // Refuse work at the edge before creating any state.
        if self.broker.is_saturated() {
            return Err(ControllerError::overloaded(format!(
                "queue is full ({} jobs)",
                self.broker.depth()
            )));
        }

        let job = self.store.create(origin, platform, suffix, self.clock.epoch_ms())?;

        if let Some(bytes) = upload {
            if let Err(e) = self.artifacts.stage_upload(&job.id, &bytes).await {
                let err = ControllerError::from(e);
                self.fail_admission(&job.id, &err);
                return Err(err);
            }
        }

        if let Err(e) = self.broker.enqueue(job.id) {
            let err = match e {
                BrokerError::Overloaded { .. } | BrokerError::Closed => {
                    ControllerError::overloaded("queue unavailable")
                }
                BrokerError::AlreadyQueued(_) => ControllerError {
                    code: ErrorCode::InternalError,
                    message: e.to_string(),
                },
            };
            self.fail_admission(&job.id, &err);
            return Err(err);
        }

        tracing::info!(id = %job.id, "job admitted");
        Ok(self.store.get(&job.id)?)
    }

    fn fail_admission(&self, id: &JobId, err: &ControllerError) {
        let patch = JobPatch::failed(err.code, err.message.clone());
        if let Err(e) = self.store.update(id, patch, self.clock.epoch_ms()) {
            tracing::warn!(%id, %e, "could not record admission failure");
        }
    }

    pub fn get(&self, id: &JobId) -> Result<Job, ControllerError> {
        Ok(self.store.get(id)?)
    }

    pub fn list_recent(&self, limit: usize) -> Vec<Job> {
        self.store.list_recent(limit.min(self.cfg.list_limit_max))
    }

    pub fn list_completed(&self, limit: usize) -> Vec<Job> {
        self.store.list_completed(limit.min(self.cfg.list_limit_max))
    }

    /// Cancel a job (direct transition while queued, cooperative signal
    /// while running).
    pub fn cancel(&self, id: &JobId) -> Result<CancelOutcome, ControllerError> {
        Ok(self.store.cancel(id, self.clock.epoch_ms())?)
    }

    /// Open the completed output for download.
    pub async fn open_output(
        &self,
        id: &JobId,
    ) -> Result<(Job, tokio::fs::File), ControllerError> {
        let job = self.store.get(id)?;
        let Some(output) = job.output.clone() else {
            return Err(ControllerError {
                code: ErrorCode::NotFound,
                message: if job.status == JobStatus::Completed {
                    format!("output for job {id} has expired")
                } else {
                    format!("job {id} has no output")
                },
            });
        };
        let file = self
            .artifacts
            .open_output(id, &output.filename, self.clock.epoch_ms())
            .await?;
        Ok((job, file))
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
