// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client-observable error taxonomy.
//!
//! Every internal failure maps into one of these codes before it reaches a
//! job record, a terminal event, or an HTTP response. Raw tool output never
//! lands here; it travels as `log` events.

use serde::{Deserialize, Serialize};

/// Classified failure codes a client may observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Input failed validation at admission
    InvalidArgument,
    /// Unknown job id or expired output
    NotFound,
    /// Illegal state transition (e.g. cancel on terminal)
    InvalidState,
    /// Queue full; retry later
    Overloaded,
    /// Input could not be obtained (network, size, time)
    FetchFailed,
    /// Input archive or manifest malformed
    InvalidPackage,
    /// Wheel download failed
    DependencyResolutionFailed,
    /// Repack tool returned an error
    PackagingFailed,
    /// Unclassified
    InternalError,
}

crate::simple_display! {
    ErrorCode {
        InvalidArgument => "invalid_argument",
        NotFound => "not_found",
        InvalidState => "invalid_state",
        Overloaded => "overloaded",
        FetchFailed => "fetch_failed",
        InvalidPackage => "invalid_package",
        DependencyResolutionFailed => "dependency_resolution_failed",
        PackagingFailed => "packaging_failed",
        InternalError => "internal_error",
    }
}
