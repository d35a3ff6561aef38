// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bounded worker pool: claim, run, retry, acknowledge.

use crate::backoff::backoff_delay;
use crate::broker::Broker;
use replug_artifacts::ArtifactStore;
use replug_core::{Clock, EventBody, JobId, JobPatch};
use replug_pipeline::Pipeline;
use replug_store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Worker pool tunables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent pipelines (defaults to the CPU count).
    pub workers: usize,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            max_retries: 2,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

/// Spawned pool of worker tasks pulling claims from the broker.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

struct WorkerCtx<C: Clock> {
    store: Arc<JobStore>,
    artifacts: Arc<ArtifactStore>,
    pipeline: Arc<Pipeline>,
    broker: Broker,
    cfg: WorkerConfig,
    clock: C,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `cfg.workers` tasks. Each runs one job at a time until the
    /// shutdown token fires (in-flight jobs drain first).
    pub fn spawn<C: Clock + 'static>(
        store: Arc<JobStore>,
        artifacts: Arc<ArtifactStore>,
        pipeline: Arc<Pipeline>,
        broker: Broker,
        cfg: WorkerConfig,
        clock: C,
        shutdown: CancellationToken,
    ) -> Self {
        let ctx = Arc::new(WorkerCtx {
            store,
            artifacts,
            pipeline,
            broker,
            cfg,
            clock,
            shutdown,
        });
        let handles = (0..ctx.cfg.workers.max(1))
            .map(|n| {
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move { worker_loop(n, ctx).await })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker task to exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop<C: Clock>(n: usize, ctx: Arc<WorkerCtx<C>>) {
    tracing::debug!(worker = n, "worker started");
    loop {
        let claimed = tokio::select! {
            claimed = ctx.broker.claim() => claimed,
            () = ctx.shutdown.cancelled() => None,
        };
        let Some(id) = claimed else { break };
        if ctx.shutdown.is_cancelled() {
            // Shutdown raced the claim; hand the job back.
            ctx.broker.nack(&id);
            break;
        }
        process(&ctx, id).await;
        ctx.broker.ack(&id);
    }
    tracing::debug!(worker = n, "worker stopped");
}

/// Run one job to a terminal state, retrying transient failures in place.
async fn process<C: Clock>(ctx: &WorkerCtx<C>, id: JobId) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let cancel = ctx.store.cancel_token(&id);
        match ctx.pipeline.run(id, cancel, &ctx.clock).await {
            Ok(()) => return,
            Err(e) if e.cancelled => {
                tracing::info!(%id, "job cancelled");
                return;
            }
            Err(e) => {
                // The store may have raced us to a terminal state (e.g.
                // cancellation landed during teardown).
                match ctx.store.get(&id) {
                    Ok(job) if !job.is_terminal() => {}
                    _ => return,
                }

                let retries_left = ctx.cfg.max_retries.saturating_sub(attempt - 1);
                if e.transient && retries_left > 0 {
                    let delay =
                        backoff_delay(attempt, ctx.cfg.backoff_base, ctx.cfg.backoff_cap);
                    tracing::warn!(%id, attempt, ?delay, error = %e, "transient failure, retrying");
                    let _ = ctx.store.publish_event(
                        &id,
                        EventBody::Log {
                            line: format!(
                                "retry {attempt}/{} after transient failure: {}",
                                ctx.cfg.max_retries, e.message
                            ),
                        },
                        ctx.clock.epoch_ms(),
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => continue,
                        () = ctx.shutdown.cancelled() => {}
                    }
                }

                tracing::warn!(%id, error = %e, "job failed");
                if let Err(update) = ctx.store.update(
                    &id,
                    JobPatch::failed(e.code, e.message.clone()),
                    ctx.clock.epoch_ms(),
                ) {
                    tracing::debug!(%id, %update, "terminal failure update rejected");
                }
                if let Err(release) = ctx.artifacts.release_workspace(&id).await {
                    tracing::warn!(%id, %release, "workspace release failed");
                }
                return;
            }
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
