// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire DTOs for the HTTP API.

use replug_core::{ErrorCode, Job, JobStatus, OutputInfo, PluginMeta};
use serde::Serialize;

/// Serializable job snapshot with computed RFC 3339 timestamps.
#[derive(Debug, Clone, Serialize)]
pub struct TaskDto {
    pub task_id: String,
    pub status: JobStatus,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    pub suffix: String,
    pub progress: u8,
    pub stage: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputInfo>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

fn rfc3339(epoch_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms as i64)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

impl From<&Job> for TaskDto {
    fn from(job: &Job) -> Self {
        Self {
            task_id: job.id.to_string(),
            status: job.status,
            origin: job.origin.to_string(),
            platform: job.platform.clone(),
            suffix: job.suffix.clone(),
            progress: job.progress,
            stage: job.stage.clone(),
            message: job.message.clone(),
            error: job.error.clone(),
            error_code: job.error_code,
            plugin: job.plugin.clone(),
            output: job.output.clone(),
            created_at: rfc3339(job.created_at_ms),
            updated_at: rfc3339(job.updated_at_ms),
            completed_at: job.completed_at_ms.map(rfc3339),
        }
    }
}

/// Response body for job creation.
#[derive(Debug, Serialize)]
pub struct CreatedDto {
    pub task_id: String,
    pub status: JobStatus,
}

impl From<&Job> for CreatedDto {
    fn from(job: &Job) -> Self {
        Self { task_id: job.id.to_string(), status: job.status }
    }
}

#[cfg(test)]
#[path = "dto_tests.rs"]
mod tests;
