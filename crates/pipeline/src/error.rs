// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stage error classification.

use replug_core::ErrorCode;

/// A classified pipeline failure.
///
/// `message` is user-safe (it lands in the job's error field); raw tool
/// output travels separately as log events. `transient` drives the worker's
/// retry decision.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct PipelineError {
    pub code: ErrorCode,
    pub message: String,
    pub transient: bool,
    pub cancelled: bool,
}

impl PipelineError {
    /// Non-retryable failure.
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), transient: false, cancelled: false }
    }

    /// Retryable failure (network hiccup, mirror 5xx, killed subprocess).
    pub fn transient(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), transient: true, cancelled: false }
    }

    /// The job's cancellation token fired; the pipeline has already
    /// transitioned the job and released its workspace.
    pub fn cancelled() -> Self {
        Self {
            code: ErrorCode::InvalidState,
            message: "cancelled".to_string(),
            transient: false,
            cancelled: true,
        }
    }
}

impl From<replug_store::StoreError> for PipelineError {
    fn from(e: replug_store::StoreError) -> Self {
        Self::fatal(e.code(), e.to_string())
    }
}

impl From<replug_artifacts::ArtifactError> for PipelineError {
    fn from(e: replug_artifacts::ArtifactError) -> Self {
        Self::fatal(ErrorCode::InternalError, e.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::fatal(ErrorCode::InternalError, format!("I/O error: {e}"))
    }
}
