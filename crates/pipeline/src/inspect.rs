// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Extract & inspect stage: unpack the archive and read its manifest.

use crate::error::PipelineError;
use replug_core::{ErrorCode, PluginMeta};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Manifest file name at the package root.
const MANIFEST: &str = "manifest.yaml";

/// The subset of the plugin manifest the service cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub name: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    /// Plain string or localized mapping; normalized by [`Manifest::meta`].
    #[serde(default)]
    description: Option<serde_yaml::Value>,
}

impl Manifest {
    pub fn meta(&self) -> PluginMeta {
        PluginMeta {
            name: self.name.clone(),
            author: self.author.clone(),
            version: self.version.clone(),
            description: describe(self.description.as_ref()),
        }
    }
}

/// Pull a human-readable description out of a plain or localized value.
fn describe(value: Option<&serde_yaml::Value>) -> String {
    match value {
        Some(serde_yaml::Value::String(s)) => s.clone(),
        Some(serde_yaml::Value::Mapping(map)) => map
            .get("en_US")
            .or_else(|| map.values().next())
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

/// Unpack `archive` into `pkg_dir` and parse the manifest at its root.
///
/// Extraction runs on the blocking pool (the zip reader is synchronous).
/// Entries that would land outside `pkg_dir` fail the package.
pub async fn extract_and_inspect(
    archive: &Path,
    pkg_dir: &Path,
) -> Result<Manifest, PipelineError> {
    let archive = archive.to_path_buf();
    let pkg = pkg_dir.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &pkg))
        .await
        .map_err(|e| {
            PipelineError::fatal(ErrorCode::InternalError, format!("extract task failed: {e}"))
        })??;
    read_manifest(pkg_dir).await
}

/// Parse the manifest of an already-extracted package (pipeline resume).
pub async fn read_manifest(pkg_dir: &Path) -> Result<Manifest, PipelineError> {
    let raw = match tokio::fs::read_to_string(pkg_dir.join(MANIFEST)).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PipelineError::fatal(ErrorCode::InvalidPackage, "manifest.yaml missing"));
        }
        Err(e) => return Err(e.into()),
    };
    let manifest: Manifest = serde_yaml::from_str(&raw).map_err(|e| {
        PipelineError::fatal(ErrorCode::InvalidPackage, format!("manifest.yaml malformed: {e}"))
    })?;
    if manifest.name.is_empty() {
        return Err(PipelineError::fatal(ErrorCode::InvalidPackage, "manifest has no name"));
    }
    Ok(manifest)
}

fn extract_blocking(archive: &Path, pkg_dir: &Path) -> Result<(), PipelineError> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| {
        PipelineError::fatal(ErrorCode::InvalidPackage, format!("not a plugin archive: {e}"))
    })?;

    std::fs::create_dir_all(pkg_dir)?;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| {
            PipelineError::fatal(ErrorCode::InvalidPackage, format!("corrupt archive: {e}"))
        })?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(PipelineError::fatal(
                ErrorCode::InvalidPackage,
                format!("archive entry escapes package root: {}", entry.name()),
            ));
        };
        let dest: PathBuf = pkg_dir.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&dest)?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "inspect_tests.rs"]
mod tests;
