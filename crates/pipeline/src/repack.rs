// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Repack stage: produce the final archive with the plugin-archive tool.

use crate::error::PipelineError;
use crate::subprocess::{run_streamed, SubprocessError};
use replug_core::ErrorCode;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Archive-tool invocation parameters.
pub struct RepackArgs<'a> {
    pub tool: &'a Path,
    pub timeout: Duration,
    pub kill_grace: Duration,
}

/// Run the plugin-archive tool over `pkg_dir`, writing `out_file`.
pub async fn repack(
    pkg_dir: &Path,
    out_file: &Path,
    params: &RepackArgs<'_>,
    cancel: &CancellationToken,
    on_line: impl FnMut(&str),
) -> Result<(), PipelineError> {
    let args = vec![
        "plugin".to_string(),
        "package".to_string(),
        pkg_dir.display().to_string(),
        "-o".to_string(),
        out_file.display().to_string(),
    ];

    let cwd = pkg_dir.parent().unwrap_or(pkg_dir);
    let output = run_streamed(
        params.tool,
        &args,
        cwd,
        cancel,
        params.timeout,
        params.kill_grace,
        on_line,
    )
    .await
    .map_err(|e| match e {
        SubprocessError::Cancelled => PipelineError::cancelled(),
        SubprocessError::TimedOut(t) => PipelineError::fatal(
            ErrorCode::PackagingFailed,
            format!("repack timed out after {t:?}"),
        ),
        SubprocessError::Spawn { tool, source } => PipelineError::fatal(
            ErrorCode::InternalError,
            format!("plugin-archive tool {tool} unavailable: {source}"),
        ),
        SubprocessError::Io(e) => PipelineError::from(e),
    })?;

    if !output.success() {
        return Err(PipelineError::fatal(
            ErrorCode::PackagingFailed,
            format!("plugin-archive tool exited with status {}", output.exit_code),
        ));
    }
    if !tokio::fs::try_exists(out_file).await? {
        return Err(PipelineError::fatal(
            ErrorCode::PackagingFailed,
            "plugin-archive tool reported success but produced no archive",
        ));
    }
    Ok(())
}
