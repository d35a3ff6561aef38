// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workspace allocation and retained output management.

use crate::paths::{confined, sanitize_filename};
use parking_lot::Mutex;
use replug_core::{Job, JobId, OutputInfo};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Artifact store tunables.
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    /// How long published outputs stay downloadable.
    pub retention_ttl: Duration,
    /// Minimum free disk space required to start a job.
    pub min_free_bytes: u64,
    /// Workspaces older than this with no owning job are reaped.
    pub orphan_workspace_age: Duration,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            retention_ttl: Duration::from_secs(24 * 60 * 60),
            min_free_bytes: 1024 * 1024 * 1024,
            orphan_workspace_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Errors from artifact operations.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("no output for job {0}")]
    NotFound(JobId),

    #[error("output for job {0} expired")]
    Expired(JobId),

    #[error("disk free space below threshold ({free} < {min} bytes)")]
    Exhausted { free: u64, min: u64 },

    #[error("unsafe path: {0}")]
    Unsafe(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Owns `work/` and `out/` under the data root.
pub struct ArtifactStore {
    work_root: PathBuf,
    out_root: PathBuf,
    cfg: ArtifactConfig,
    /// Retention deadline (epoch ms) per published output.
    deadlines: Mutex<HashMap<JobId, u64>>,
}

impl ArtifactStore {
    /// Create the store, ensuring both roots (and the upload handoff area)
    /// exist.
    pub fn new(data_root: &Path, cfg: ArtifactConfig) -> Result<Self, ArtifactError> {
        let work_root = data_root.join("work");
        let out_root = data_root.join("out");
        std::fs::create_dir_all(work_root.join("uploads"))?;
        std::fs::create_dir_all(&out_root)?;
        Ok(Self { work_root, out_root, cfg, deadlines: Mutex::new(HashMap::new()) })
    }

    /// The job's workspace directory path (not necessarily existing).
    pub fn workspace_path(&self, id: &JobId) -> PathBuf {
        self.work_root.join(id.as_str())
    }

    /// The handoff path where the controller stages an uploaded package.
    pub fn upload_path(&self, id: &JobId) -> PathBuf {
        self.work_root.join("uploads").join(id.as_str())
    }

    /// Create the job's workspace with private permissions.
    ///
    /// Fails with [`ArtifactError::Exhausted`] when free disk space is
    /// below the configured minimum. Re-allocation for an existing
    /// workspace is allowed (pipeline resume).
    pub async fn allocate_workspace(&self, id: &JobId) -> Result<PathBuf, ArtifactError> {
        let free = fs2::available_space(&self.work_root)?;
        if free < self.cfg.min_free_bytes {
            return Err(ArtifactError::Exhausted { free, min: self.cfg.min_free_bytes });
        }

        let path = self.workspace_path(id);
        tokio::fs::create_dir_all(&path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;
        }
        if !confined(&self.work_root, &path)? {
            return Err(ArtifactError::Unsafe(path.display().to_string()));
        }
        tracing::debug!(%id, path = %path.display(), "workspace allocated");
        Ok(path)
    }

    /// Recursively delete the workspace (and any staged upload). Idempotent.
    pub async fn release_workspace(&self, id: &JobId) -> Result<(), ArtifactError> {
        for path in [self.workspace_path(id), self.upload_path(id)] {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
                    tokio::fs::remove_file(&path).await.ok();
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!(%id, "workspace released");
        Ok(())
    }

    /// Stage an uploaded package at the handoff path.
    pub async fn stage_upload(&self, id: &JobId, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        let free = fs2::available_space(&self.work_root)?;
        if free < self.cfg.min_free_bytes {
            return Err(ArtifactError::Exhausted { free, min: self.cfg.min_free_bytes });
        }
        let path = self.upload_path(id);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Move a finished file into `out/<job>/<filename>` and describe it.
    ///
    /// Idempotent: republishing a file with identical content yields the
    /// same descriptor.
    pub async fn publish_output(
        &self,
        id: &JobId,
        source: &Path,
        filename: &str,
        now_ms: u64,
    ) -> Result<OutputInfo, ArtifactError> {
        let filename = sanitize_filename(filename).map_err(ArtifactError::Unsafe)?;
        let dir = self.out_root.join(id.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(filename);
        if !confined(&self.out_root, &dest)? {
            return Err(ArtifactError::Unsafe(dest.display().to_string()));
        }

        if tokio::fs::try_exists(&dest).await? {
            // Retried publish: accept identical content silently.
            let existing = sha256_file(&dest).await?;
            let incoming = sha256_file(source).await?;
            if existing == incoming {
                let size = tokio::fs::metadata(&dest).await?.len();
                self.stamp(id, now_ms);
                return Ok(OutputInfo { filename: filename.to_string(), size, sha256: existing });
            }
        }

        tokio::fs::rename(source, &dest).await?;
        let sha256 = sha256_file(&dest).await?;
        let size = tokio::fs::metadata(&dest).await?.len();
        self.stamp(id, now_ms);
        tracing::info!(%id, filename, size, "output published");
        Ok(OutputInfo { filename: filename.to_string(), size, sha256 })
    }

    fn stamp(&self, id: &JobId, now_ms: u64) {
        let deadline = now_ms + self.cfg.retention_ttl.as_millis() as u64;
        self.deadlines.lock().insert(*id, deadline);
    }

    /// Open the published output for streaming.
    pub async fn open_output(
        &self,
        id: &JobId,
        filename: &str,
        now_ms: u64,
    ) -> Result<tokio::fs::File, ArtifactError> {
        let filename = sanitize_filename(filename).map_err(ArtifactError::Unsafe)?;
        match self.deadlines.lock().get(id) {
            Some(deadline) if now_ms >= *deadline => return Err(ArtifactError::Expired(*id)),
            Some(_) => {}
            None => return Err(ArtifactError::NotFound(*id)),
        }

        let path = self.out_root.join(id.as_str()).join(filename);
        if !confined(&self.out_root, &path)? {
            return Err(ArtifactError::Unsafe(path.display().to_string()));
        }
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(*id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Re-stamp retention deadlines after a restart and drop anything the
    /// store no longer references. Returns jobs whose output file is gone.
    pub async fn restore(&self, jobs: &[Job]) -> Result<Vec<JobId>, ArtifactError> {
        let mut missing = Vec::new();
        let mut referenced: std::collections::HashSet<String> = std::collections::HashSet::new();

        for job in jobs {
            let Some(output) = &job.output else { continue };
            let basis = job.completed_at_ms.unwrap_or(job.created_at_ms);
            let path = self.out_root.join(job.id.as_str()).join(&output.filename);
            if tokio::fs::try_exists(&path).await? {
                self.stamp(&job.id, basis);
                referenced.insert(job.id.to_string());
            } else {
                missing.push(job.id);
            }
        }

        // Outputs on disk with no owning job record are unrecoverable.
        let mut entries = tokio::fs::read_dir(&self.out_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) {
                tracing::warn!(dir = %name, "removing unreferenced output directory");
                tokio::fs::remove_dir_all(entry.path()).await.ok();
            }
        }
        Ok(missing)
    }

    /// Remove expired outputs and orphaned workspaces.
    ///
    /// Returns the job ids whose output was reaped so the caller can clear
    /// their descriptors. `live_workspaces` names the jobs whose workspace
    /// must be left alone.
    pub async fn reap(
        &self,
        now_ms: u64,
        live_workspaces: &[JobId],
    ) -> Result<Vec<JobId>, ArtifactError> {
        let expired: Vec<JobId> = {
            let deadlines = self.deadlines.lock();
            deadlines
                .iter()
                .filter(|(_, deadline)| now_ms >= **deadline)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            tokio::fs::remove_dir_all(self.out_root.join(id.as_str())).await.ok();
            self.deadlines.lock().remove(id);
            tracing::info!(%id, "output reaped");
        }

        // Orphaned workspaces: no owning live job and untouched for an hour.
        let cutoff = Duration::from_millis(now_ms).saturating_sub(self.cfg.orphan_workspace_age);
        let mut entries = tokio::fs::read_dir(&self.work_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "uploads" || live_workspaces.iter().any(|id| id.as_str() == name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            let age_ok = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).ok())
                .is_some_and(|mtime| mtime <= cutoff);
            if age_ok {
                tracing::warn!(dir = %name, "reaping orphaned workspace");
                tokio::fs::remove_dir_all(entry.path()).await.ok();
            }
        }
        Ok(expired)
    }
}

/// Streaming SHA-256 of a file, hex-encoded.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(hex, "{byte:02x}");
    }
    Ok(hex)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
