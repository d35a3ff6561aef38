// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job identity, origin variants, and the repackaging state machine.

use crate::error::ErrorCode;
use serde::{Deserialize, Serialize};

crate::define_id! {
    /// Unique identifier for a repackaging job.
    ///
    /// Allocated at admission and carried through the queue, the pipeline,
    /// the event stream, and the artifact layout (`work/<id>/`, `out/<id>/`).
    pub struct JobId("job-");
}

/// Default output suffix appended to the input stem.
pub const DEFAULT_SUFFIX: &str = "offline";

/// Maximum accepted suffix length.
const MAX_SUFFIX_LEN: usize = 32;

/// Validate an output suffix: `[A-Za-z0-9._-]{1,32}`.
pub fn validate_suffix(suffix: &str) -> bool {
    !suffix.is_empty()
        && suffix.len() <= MAX_SUFFIX_LEN
        && suffix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, waiting for a worker
    Pending,
    /// Fetch stage in flight
    Downloading,
    /// Extract through repack stages in flight
    Processing,
    /// Output published
    Completed,
    /// Terminal error
    Failed,
    /// Cancelled by the client
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Whether the state machine permits `self → next`.
    ///
    /// Forward path is `pending → downloading → processing → completed`.
    /// Any non-terminal status may move to `failed` or `cancelled`, and may
    /// rewind to `pending` (retry, which resets progress). Same-status
    /// updates are progress ticks, always allowed while non-terminal.
    pub fn accepts(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        match (*self, next) {
            (a, b) if a == b => true,
            (_, Failed) | (_, Cancelled) => true,
            (_, Pending) => true,
            (Pending, Downloading) => true,
            (Downloading, Processing) => true,
            (Processing, Completed) => true,
            _ => false,
        }
    }
}

crate::simple_display! {
    JobStatus {
        Pending => "pending",
        Downloading => "downloading",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

/// Where the input `.difypkg` comes from.
///
/// Each variant carries its own descriptor and validation; downstream the
/// semantics are identical (the pipeline's Fetch stage normalizes all three
/// into `input.difypkg` in the workspace).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    /// Direct http(s) download
    Url { url: String },
    /// Marketplace coordinate, composed into the canonical download URL
    Marketplace { author: String, name: String, version: String },
    /// File staged by the controller at the upload handoff path
    Upload { filename: String },
}

/// Validation failures for [`Origin`] descriptors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OriginError {
    #[error("URL is not valid: {0}")]
    MalformedUrl(String),

    #[error("URL scheme must be http or https, got {0:?}")]
    UnsupportedScheme(String),

    #[error("marketplace {field} must be non-empty [A-Za-z0-9._-]")]
    BadCoordinate { field: &'static str },

    #[error("upload filename must end with .difypkg")]
    NotAPackage,
}

fn coordinate_ok(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

impl Origin {
    /// Validate the descriptor at admission time.
    pub fn validate(&self) -> Result<(), OriginError> {
        match self {
            Origin::Url { url } => {
                let parsed = url::Url::parse(url)
                    .map_err(|e| OriginError::MalformedUrl(e.to_string()))?;
                match parsed.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(OriginError::UnsupportedScheme(other.to_string())),
                }
            }
            Origin::Marketplace { author, name, version } => {
                for (field, value) in
                    [("author", author), ("name", name), ("version", version)]
                {
                    if !coordinate_ok(value) {
                        return Err(OriginError::BadCoordinate { field });
                    }
                }
                Ok(())
            }
            Origin::Upload { filename } => {
                if filename.len() > ".difypkg".len() && filename.ends_with(".difypkg") {
                    Ok(())
                } else {
                    Err(OriginError::NotAPackage)
                }
            }
        }
    }

    /// Output filename stem, when the origin itself names the input.
    ///
    /// URL and upload origins derive the stem from the source filename;
    /// marketplace origins have no outer name, so the pipeline falls back
    /// to the archive's inner name after the inspect stage.
    pub fn stem(&self) -> Option<String> {
        let strip = |name: &str| {
            name.strip_suffix(".difypkg").filter(|s| !s.is_empty()).map(str::to_string)
        };
        match self {
            Origin::Url { url } => {
                let parsed = url::Url::parse(url).ok()?;
                let last = parsed.path_segments()?.next_back()?.to_string();
                strip(&last)
            }
            Origin::Upload { filename } => strip(filename),
            Origin::Marketplace { .. } => None,
        }
    }
}

crate::simple_display! {
    Origin {
        Url { .. } => "url",
        Marketplace { .. } => "marketplace",
        Upload { .. } => "upload",
    }
}

/// Plugin identity read from the package manifest during inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub author: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Descriptor of the published output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    pub filename: String,
    pub size: u64,
    pub sha256: String,
}

/// A repackaging job record.
///
/// Owned by the job store; mutated only through [`JobPatch`] so status
/// transitions stay serialized behind the store's compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub origin: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub suffix: String,
    pub status: JobStatus,
    pub progress: u8,
    /// Current stage label (`queued`, `fetch`, `inspect`, ...)
    pub stage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputInfo>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    /// True once the record expired to id + terminal status only.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tombstone: bool,
}

impl Job {
    /// Create a new pending job.
    pub fn new(origin: Origin, platform: Option<String>, suffix: String, epoch_ms: u64) -> Self {
        Self {
            id: JobId::new(),
            origin,
            platform,
            suffix,
            status: JobStatus::Pending,
            progress: 0,
            stage: "queued".to_string(),
            message: String::new(),
            error: None,
            error_code: None,
            plugin: None,
            output: None,
            created_at_ms: epoch_ms,
            updated_at_ms: epoch_ms,
            completed_at_ms: None,
            tombstone: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply an already-validated patch. Progress is monotone within an
    /// attempt: lower values are kept only on an explicit rewind to pending.
    pub fn apply(&mut self, patch: &JobPatch, epoch_ms: u64) {
        if let Some(status) = patch.status {
            if status == JobStatus::Pending && self.status != JobStatus::Pending {
                // Retry rewind resets the attempt.
                self.progress = 0;
                self.error = None;
                self.error_code = None;
            }
            self.status = status;
            if status.is_terminal() {
                self.completed_at_ms = Some(epoch_ms);
            }
        }
        if let Some(progress) = patch.progress {
            self.progress = self.progress.max(progress.min(100));
        }
        if let Some(ref stage) = patch.stage {
            self.stage = stage.clone();
        }
        if let Some(ref message) = patch.message {
            self.message = message.clone();
        }
        if let Some(ref error) = patch.error {
            self.error = Some(error.clone());
        }
        if let Some(code) = patch.error_code {
            self.error_code = Some(code);
        }
        if let Some(ref plugin) = patch.plugin {
            self.plugin = Some(plugin.clone());
        }
        if let Some(ref output) = patch.output {
            self.output = Some(output.clone());
        }
        self.updated_at_ms = epoch_ms;
    }

    /// Reduce an expired record to its tombstone: id and terminal status
    /// (plus timestamps) survive; everything else is dropped.
    pub fn into_tombstone(mut self) -> Self {
        self.message = String::new();
        self.error = None;
        self.plugin = None;
        self.output = None;
        self.stage = String::new();
        self.tombstone = true;
        self
    }
}

/// Additive patch for [`Job`]; unspecified fields are preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub plugin: Option<PluginMeta>,
    pub output: Option<OutputInfo>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    crate::setters! {
        option {
            status: JobStatus,
            progress: u8,
            stage: String,
            message: String,
            error: String,
            error_code: ErrorCode,
            plugin: PluginMeta,
            output: OutputInfo,
        }
    }

    /// Shorthand for a terminal failure patch.
    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new().status(JobStatus::Failed).error(message).error_code(code)
    }
}

crate::builder! {
    pub struct JobBuilder => Job {
        into {
            suffix: String = DEFAULT_SUFFIX,
            stage: String = "queued",
            message: String = "",
        }
        set {
            origin: Origin = Origin::Url { url: "https://example.com/x.difypkg".to_string() },
            status: JobStatus = JobStatus::Pending,
            progress: u8 = 0,
            created_at_ms: u64 = 1_000_000,
            updated_at_ms: u64 = 1_000_000,
            tombstone: bool = false,
        }
        option {
            platform: String = None,
            error: String = None,
            error_code: ErrorCode = None,
            plugin: PluginMeta = None,
            output: OutputInfo = None,
            completed_at_ms: u64 = None,
        }
        computed {
            id: JobId = JobId::new(),
        }
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
