// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stage sequencing, resume detection, and terminal bookkeeping.

use crate::error::PipelineError;
use crate::fetch::{fetch_url, marketplace_url, FetchLimits};
use crate::inspect::{extract_and_inspect, read_manifest, Manifest};
use crate::progress::Reporter;
use crate::repack::{repack, RepackArgs};
use crate::resolve::{resolve_wheels, ResolveArgs, WHEELS_DONE};
use crate::rewrite::{amend_ignore_list, rewrite_requirements};
use replug_artifacts::{ArtifactError, ArtifactStore};
use replug_core::{Clock, ErrorCode, Job, JobId, JobPatch, JobStatus, Origin};
use replug_store::JobStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Internal name of the repacked archive inside the workspace (renamed to
/// its public filename at publish time).
const REPACKED: &str = "repacked.difypkg";

/// Pipeline tunables (tool paths, caps, deadlines).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Packaging tool binary (pip-compatible argv contract).
    pub packaging_tool: PathBuf,
    /// Plugin-archive tool binary, selected for the host OS/arch.
    pub archive_tool: PathBuf,
    pub marketplace_base: String,
    /// Optional package index mirror passed to the packaging tool.
    pub mirror_url: Option<String>,
    pub size_cap: u64,
    pub fetch_time_cap: Duration,
    pub stage_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            packaging_tool: PathBuf::from("pip"),
            archive_tool: PathBuf::from("dify-plugin"),
            marketplace_base: "https://marketplace.dify.ai".to_string(),
            mirror_url: None,
            size_cap: 500 * 1024 * 1024,
            fetch_time_cap: Duration::from_secs(600),
            stage_timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(10),
        }
    }
}

/// Executes the repackaging stages for one job at a time.
pub struct Pipeline {
    store: Arc<JobStore>,
    artifacts: Arc<ArtifactStore>,
    cfg: PipelineConfig,
    http: reqwest::Client,
}

impl Pipeline {
    pub fn new(
        store: Arc<JobStore>,
        artifacts: Arc<ArtifactStore>,
        cfg: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                PipelineError::fatal(ErrorCode::InternalError, format!("http client: {e}"))
            })?;
        Ok(Self { store, artifacts, cfg, http })
    }

    /// Run (or resume) the pipeline for `job_id`.
    ///
    /// On cancellation this transitions the job and releases the workspace
    /// before returning; all other failures leave the terminal bookkeeping
    /// to the worker, which knows the retry budget.
    pub async fn run<C: Clock>(
        &self,
        job_id: JobId,
        cancel: CancellationToken,
        clock: &C,
    ) -> Result<(), PipelineError> {
        match self.execute(&job_id, &cancel, clock).await {
            Err(e) if e.cancelled => {
                let _ = self.store.update(
                    &job_id,
                    JobPatch::new().status(JobStatus::Cancelled).message("cancelled"),
                    clock.epoch_ms(),
                );
                if let Err(release) = self.artifacts.release_workspace(&job_id).await {
                    tracing::warn!(%job_id, %release, "workspace release after cancel failed");
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn execute<C: Clock>(
        &self,
        id: &JobId,
        cancel: &CancellationToken,
        clock: &C,
    ) -> Result<(), PipelineError> {
        let job = self.store.get(id)?;
        if job.is_terminal() {
            // Cancelled (or otherwise finished) while queued.
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled());
        }
        if job.status != JobStatus::Pending {
            // Re-invocation of an interrupted attempt: rewind so the state
            // machine walks forward from the top (progress resets; finished
            // stage artifacts in the workspace are still honored below).
            self.store.update(
                id,
                JobPatch::new().status(JobStatus::Pending).stage("queued"),
                clock.epoch_ms(),
            )?;
        }

        let ws = self.artifacts.allocate_workspace(id).await.map_err(|e| match e {
            ArtifactError::Exhausted { free, min } => PipelineError::transient(
                ErrorCode::InternalError,
                format!("insufficient disk space ({free} of {min} bytes free)"),
            ),
            other => other.into(),
        })?;
        let input = ws.join("input.difypkg");
        let pkg_dir = ws.join("pkg");
        let mut reporter = Reporter::new(Arc::clone(&self.store), *id, clock.clone());

        // Fetch (0-30)
        reporter.status(JobStatus::Downloading, 0, "fetch", "obtaining source package")?;
        if !tokio::fs::try_exists(&input).await? {
            self.fetch(&job, &input, cancel, &mut reporter).await?;
        }
        reporter.status(JobStatus::Downloading, 30, "fetch", "source package ready")?;
        self.boundary(cancel)?;

        // Extract & inspect (30-40)
        reporter.status(JobStatus::Processing, 30, "inspect", "reading plugin manifest")?;
        let manifest = self.inspect(&input, &pkg_dir).await?;
        reporter.meta(manifest.meta())?;
        reporter.status(JobStatus::Processing, 40, "inspect", "manifest parsed")?;
        self.boundary(cancel)?;

        // Resolve (40-80)
        reporter.status(JobStatus::Processing, 40, "resolve", "downloading dependency wheels")?;
        if !tokio::fs::try_exists(pkg_dir.join(WHEELS_DONE)).await? {
            let params = ResolveArgs {
                tool: &self.cfg.packaging_tool,
                platform: job.platform.as_deref(),
                mirror: self.cfg.mirror_url.as_deref(),
                timeout: self.cfg.stage_timeout,
                kill_grace: self.cfg.kill_grace,
            };
            resolve_wheels(&pkg_dir, &params, cancel, |line| reporter.log(line)).await?;
        }
        reporter.status(JobStatus::Processing, 80, "resolve", "wheels resolved")?;
        self.boundary(cancel)?;

        // Rewrite (80-90)
        rewrite_requirements(&pkg_dir).await?;
        amend_ignore_list(&pkg_dir).await?;
        reporter.status(JobStatus::Processing, 90, "rewrite", "package rewritten for offline install")?;
        self.boundary(cancel)?;

        // Repack (90-98)
        let repacked = ws.join(REPACKED);
        if !tokio::fs::try_exists(&repacked).await? {
            let params = RepackArgs {
                tool: &self.cfg.archive_tool,
                timeout: self.cfg.stage_timeout,
                kill_grace: self.cfg.kill_grace,
            };
            repack(&pkg_dir, &repacked, &params, cancel, |line| reporter.log(line)).await?;
        }
        let stem = job
            .origin
            .stem()
            .unwrap_or_else(|| format!("{}-{}", manifest.name, manifest.version));
        let filename = format!("{stem}-{}.difypkg", job.suffix);
        let output = self
            .artifacts
            .publish_output(id, &repacked, &filename, clock.epoch_ms())
            .await
            .map_err(|e| match e {
                ArtifactError::Unsafe(m) => PipelineError::fatal(ErrorCode::PackagingFailed, m),
                other => other.into(),
            })?;
        reporter.status(JobStatus::Processing, 98, "repack", "archive published")?;
        self.boundary(cancel)?;

        // Finalize (98-100)
        self.store.update(
            id,
            JobPatch::new()
                .status(JobStatus::Completed)
                .progress(100u8)
                .stage("finalize")
                .message("repackaging complete")
                .plugin(manifest.meta())
                .output(output),
            clock.epoch_ms(),
        )?;
        self.artifacts.release_workspace(id).await?;
        tracing::info!(%id, filename, "job completed");
        Ok(())
    }

    /// Stage-boundary cancellation check.
    fn boundary(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            Err(PipelineError::cancelled())
        } else {
            Ok(())
        }
    }

    async fn fetch<C: Clock>(
        &self,
        job: &Job,
        input: &Path,
        cancel: &CancellationToken,
        reporter: &mut Reporter<C>,
    ) -> Result<(), PipelineError> {
        let limits =
            FetchLimits { size_cap: self.cfg.size_cap, time_cap: self.cfg.fetch_time_cap };
        let url = match &job.origin {
            Origin::Url { url } => url.clone(),
            Origin::Marketplace { author, name, version } => {
                marketplace_url(&self.cfg.marketplace_base, author, name, version)
            }
            Origin::Upload { .. } => {
                let staged = self.artifacts.upload_path(&job.id);
                if !tokio::fs::try_exists(&staged).await? {
                    return Err(PipelineError::fatal(
                        ErrorCode::FetchFailed,
                        "staged upload is missing",
                    ));
                }
                tokio::fs::rename(&staged, input).await?;
                return Ok(());
            }
        };

        fetch_url(&self.http, &url, input, &limits, cancel, |written, total| {
            if let Some(total) = total.filter(|t| *t > 0) {
                let pct = 2 + ((written.min(total) * 26) / total) as u8;
                let _ = reporter.status(JobStatus::Downloading, pct, "fetch", "downloading");
            }
        })
        .await
    }

    async fn inspect(&self, input: &Path, pkg_dir: &Path) -> Result<Manifest, PipelineError> {
        if tokio::fs::try_exists(pkg_dir.join("manifest.yaml")).await? {
            // Already extracted by a previous attempt.
            return read_manifest(pkg_dir).await;
        }
        tokio::time::timeout(self.cfg.stage_timeout, extract_and_inspect(input, pkg_dir))
            .await
            .map_err(|_| {
                PipelineError::fatal(ErrorCode::InvalidPackage, "package extraction timed out")
            })?
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
