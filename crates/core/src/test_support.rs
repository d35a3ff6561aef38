// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test helpers and proptest strategies.

use crate::job::{JobStatus, Origin};

/// All statuses, for exhaustive table tests.
pub const ALL_STATUSES: [JobStatus; 6] = [
    JobStatus::Pending,
    JobStatus::Downloading,
    JobStatus::Processing,
    JobStatus::Completed,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

/// A valid URL origin pointing at `name.difypkg`.
pub fn url_origin(name: &str) -> Origin {
    Origin::Url { url: format!("https://plugins.example.com/{name}.difypkg") }
}

/// A valid marketplace origin.
pub fn marketplace_origin(author: &str, name: &str, version: &str) -> Origin {
    Origin::Marketplace {
        author: author.to_string(),
        name: name.to_string(),
        version: version.to_string(),
    }
}

pub mod strategies {
    use super::*;
    use proptest::prelude::*;

    pub fn any_status() -> impl Strategy<Value = JobStatus> {
        proptest::sample::select(ALL_STATUSES.to_vec())
    }

    pub fn valid_suffix() -> impl Strategy<Value = String> {
        "[A-Za-z0-9._-]{1,32}"
    }
}
