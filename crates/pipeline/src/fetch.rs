// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fetch stage: streaming download with size and duration caps.

use crate::error::PipelineError;
use futures_util::StreamExt;
use replug_core::ErrorCode;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Download caps enforced during fetch.
#[derive(Debug, Clone)]
pub struct FetchLimits {
    pub size_cap: u64,
    pub time_cap: Duration,
}

/// Compose the canonical marketplace download URL for a coordinate.
pub fn marketplace_url(base: &str, author: &str, name: &str, version: &str) -> String {
    format!("{}/api/v1/plugins/{author}/{name}/{version}/download", base.trim_end_matches('/'))
}

/// Download `url` to `dest`, streaming chunks and reporting progress as
/// `(bytes_written, content_length)`.
///
/// Size and duration cap breaches are non-retryable; connection failures
/// and truncated transfers are retryable. 5xx responses are retryable,
/// other non-2xx are not.
pub async fn fetch_url(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    limits: &FetchLimits,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64, Option<u64>),
) -> Result<(), PipelineError> {
    let deadline = tokio::time::Instant::now() + limits.time_cap;

    let resp = tokio::select! {
        resp = client.get(url).send() => resp.map_err(|e| {
            PipelineError::transient(ErrorCode::FetchFailed, format!("request failed: {e}"))
        })?,
        () = cancel.cancelled() => return Err(PipelineError::cancelled()),
        () = tokio::time::sleep_until(deadline) => {
            return Err(PipelineError::fatal(
                ErrorCode::FetchFailed,
                "download exceeded duration cap",
            ));
        }
    };

    let status = resp.status();
    if !status.is_success() {
        let message = format!("server returned {status}");
        return Err(if status.is_server_error() {
            PipelineError::transient(ErrorCode::FetchFailed, message)
        } else {
            PipelineError::fatal(ErrorCode::FetchFailed, message)
        });
    }

    let total = resp.content_length();
    if let Some(total) = total {
        if total > limits.size_cap {
            return Err(PipelineError::fatal(
                ErrorCode::FetchFailed,
                format!("content length {total} exceeds size cap {}", limits.size_cap),
            ));
        }
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = resp.bytes_stream();
    let mut written = 0u64;

    loop {
        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            () = cancel.cancelled() => return Err(PipelineError::cancelled()),
            () = tokio::time::sleep_until(deadline) => {
                return Err(PipelineError::fatal(
                    ErrorCode::FetchFailed,
                    "download exceeded duration cap",
                ));
            }
        };
        match chunk {
            None => break,
            Some(Err(e)) => {
                return Err(PipelineError::transient(
                    ErrorCode::FetchFailed,
                    format!("download interrupted: {e}"),
                ));
            }
            Some(Ok(bytes)) => {
                written += bytes.len() as u64;
                if written > limits.size_cap {
                    return Err(PipelineError::fatal(
                        ErrorCode::FetchFailed,
                        format!("download exceeds size cap {}", limits.size_cap),
                    ));
                }
                file.write_all(&bytes).await?;
                on_progress(written, total);
            }
        }
    }
    file.flush().await?;

    if let Some(total) = total {
        if written != total {
            return Err(PipelineError::transient(
                ErrorCode::FetchFailed,
                format!("truncated transfer: {written} of {total} bytes"),
            ));
        }
    }
    if written == 0 {
        return Err(PipelineError::fatal(ErrorCode::FetchFailed, "empty response body"));
    }
    tracing::debug!(url, written, "fetch complete");
    Ok(())
}

#[cfg(test)]
#[path = "fetch_tests.rs"]
mod tests;
