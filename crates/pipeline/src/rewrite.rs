// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rewrite stage: point the package at its bundled wheels.
//!
//! Prepends `--no-index --find-links` directives to the requirements file
//! and amends the package ignore-list so `wheels/` ships in the final
//! archive. Both edits are idempotent.

use crate::error::PipelineError;
use std::path::Path;

const REQUIREMENTS: &str = "requirements.txt";
const IGNORE_FILE: &str = ".difyignore";

const NO_INDEX: &str = "--no-index";
const FIND_LINKS: &str = "--find-links ./wheels/";
const UNIGNORE_WHEELS: &str = "!wheels/";

/// Rewrite `requirements.txt` so installation resolves from `wheels/`.
///
/// A package with no requirements file has nothing to rewrite.
pub async fn rewrite_requirements(pkg_dir: &Path) -> Result<(), PipelineError> {
    let path = pkg_dir.join(REQUIREMENTS);
    let body = match tokio::fs::read_to_string(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut lines: Vec<&str> = Vec::with_capacity(2);
    if !body.lines().any(|l| l.trim() == NO_INDEX) {
        lines.push(NO_INDEX);
    }
    if !body.lines().any(|l| l.trim().starts_with("--find-links")) {
        lines.push(FIND_LINKS);
    }
    if lines.is_empty() {
        return Ok(());
    }

    let rewritten = format!("{}\n{}", lines.join("\n"), body);
    tokio::fs::write(&path, rewritten).await?;
    tracing::debug!(path = %path.display(), "requirements rewritten for offline install");
    Ok(())
}

/// Make sure the ignore-list does not exclude `wheels/` from packaging.
///
/// Lines that would ignore the wheels directory are dropped and a negation
/// entry is appended. A missing ignore file needs no amendment.
pub async fn amend_ignore_list(pkg_dir: &Path) -> Result<(), PipelineError> {
    let path = pkg_dir.join(IGNORE_FILE);
    let body = match tokio::fs::read_to_string(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let mut kept: Vec<&str> = body
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !matches!(trimmed, "wheels" | "wheels/" | "wheels/*" | "wheels/**" | "*.whl")
        })
        .collect();

    let changed = kept.len() != body.lines().count();
    if !kept.iter().any(|l| l.trim() == UNIGNORE_WHEELS) {
        kept.push(UNIGNORE_WHEELS);
    } else if !changed {
        return Ok(());
    }

    let mut rewritten = kept.join("\n");
    rewritten.push('\n');
    tokio::fs::write(&path, rewritten).await?;
    tracing::debug!(path = %path.display(), "ignore list amended to ship wheels");
    Ok(())
}

#[cfg(test)]
#[path = "rewrite_tests.rs"]
mod tests;
