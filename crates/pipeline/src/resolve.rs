// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resolve stage: download dependency wheels via the packaging tool.

use crate::error::PipelineError;
use crate::subprocess::{run_streamed, SubprocessError, ToolOutput};
use replug_core::ErrorCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Marker written after a successful resolve (resume detection).
pub const WHEELS_DONE: &str = "wheels/.done";

/// Packaging-tool invocation parameters.
pub struct ResolveArgs<'a> {
    pub tool: &'a Path,
    pub platform: Option<&'a str>,
    pub mirror: Option<&'a str>,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

fn build_args(platform: Option<&str>, mirror: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "download".to_string(),
        "-r".to_string(),
        "requirements.txt".to_string(),
        "-d".to_string(),
        "./wheels/".to_string(),
    ];
    if let Some(platform) = platform {
        args.extend([
            "--platform".to_string(),
            platform.to_string(),
            "--only-binary=:all:".to_string(),
        ]);
    }
    if let Some(mirror) = mirror {
        args.extend(["-i".to_string(), mirror.to_string()]);
    }
    args
}

/// Download all declared wheels into `pkg_dir/wheels/`.
///
/// Tool output is forwarded line by line via `on_line`. A package with no
/// requirements file resolves trivially (an empty wheels directory).
pub async fn resolve_wheels(
    pkg_dir: &Path,
    params: &ResolveArgs<'_>,
    cancel: &CancellationToken,
    on_line: impl FnMut(&str),
) -> Result<(), PipelineError> {
    let wheels: PathBuf = pkg_dir.join("wheels");
    tokio::fs::create_dir_all(&wheels).await?;

    if !tokio::fs::try_exists(pkg_dir.join("requirements.txt")).await? {
        tracing::debug!(pkg = %pkg_dir.display(), "no requirements.txt, nothing to resolve");
        tokio::fs::write(pkg_dir.join(WHEELS_DONE), b"").await?;
        return Ok(());
    }

    let args = build_args(params.platform, params.mirror);
    let output = run_streamed(
        params.tool,
        &args,
        pkg_dir,
        cancel,
        params.timeout,
        params.kill_grace,
        on_line,
    )
    .await
    .map_err(|e| match e {
        SubprocessError::Cancelled => PipelineError::cancelled(),
        SubprocessError::TimedOut(t) => PipelineError::fatal(
            ErrorCode::DependencyResolutionFailed,
            format!("wheel download timed out after {t:?}"),
        ),
        SubprocessError::Spawn { tool, source } => PipelineError::fatal(
            ErrorCode::InternalError,
            format!("packaging tool {tool} unavailable: {source}"),
        ),
        SubprocessError::Io(e) => PipelineError::from(e),
    })?;

    if !output.success() {
        let message = if output.tail.is_empty() {
            format!("packaging tool exited with status {}", output.exit_code)
        } else {
            format!(
                "packaging tool exited with status {}: {}",
                output.exit_code,
                last_lines(&output.tail, 3)
            )
        };
        return Err(if transient_tool_failure(&output) {
            PipelineError::transient(ErrorCode::DependencyResolutionFailed, message)
        } else {
            PipelineError::fatal(ErrorCode::DependencyResolutionFailed, message)
        });
    }

    tokio::fs::write(pkg_dir.join(WHEELS_DONE), b"").await?;
    Ok(())
}

/// Whether a failed tool run is worth retrying.
///
/// A signal-kill without a cap breach, or mirror-side trouble (5xx,
/// dropped or timed-out connections), may clear up on retry. Anything
/// else (unknown package, version conflict, malformed requirements) is
/// deterministic and fails the job on first occurrence.
fn transient_tool_failure(output: &ToolOutput) -> bool {
    if output.signalled() {
        return true;
    }
    let tail = output.tail.to_ascii_lowercase();
    const RETRYABLE: [&str; 6] = [
        "http error 5",
        "502",
        "503",
        "504",
        "connection",
        "timed out",
    ];
    RETRYABLE.iter().any(|marker| tail.contains(marker))
}

/// Last `n` lines of a tool tail, joined for a compact error message.
fn last_lines(tail: &str, n: usize) -> String {
    let lines: Vec<&str> = tail.lines().rev().take(n).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join(" | ")
}

#[cfg(test)]
#[path = "resolve_tests.rs"]
mod tests;
