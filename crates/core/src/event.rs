// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-job progress events.
//!
//! Serializes with `{"type": "status", ...fields}` format; the same shape
//! is journaled for replay and framed to WebSocket subscribers.

use crate::error::ErrorCode;
use crate::job::{JobId, JobStatus, OutputInfo, PluginMeta};
use serde::{Deserialize, Serialize};

/// One tick on a job's event stream.
///
/// `seq` is assigned by the job store at publish time: monotonic per job,
/// starting at 1, gap-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub seq: u64,
    pub ts_ms: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

/// Event payload variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// Status/progress tick; carries plugin metadata once known
    Status {
        status: JobStatus,
        progress: u8,
        stage: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plugin: Option<PluginMeta>,
    },

    /// Free-form tool output line
    Log { line: String },

    /// Events were dropped for this subscriber (slow consumer); never
    /// stored, synthesized per subscription and framed as a log line
    Gap { dropped: u32 },

    /// Final event on the topic; exactly one per job
    Terminal {
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<OutputInfo>,
    },
}

impl EventBody {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventBody::Terminal { .. })
    }
}

crate::simple_display! {
    EventBody {
        Status { .. } => "status",
        Log { .. } => "log",
        Gap { .. } => "gap",
        Terminal { .. } => "terminal",
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
