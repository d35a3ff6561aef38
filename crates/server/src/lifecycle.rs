// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup wiring, recovery, reapers, and graceful shutdown.

use crate::config::Config;
use crate::routes::{self, AppState};
use replug_artifacts::ArtifactStore;
use replug_bus::EventBus;
use replug_core::{Clock, ErrorCode, JobPatch, JobStatus, SystemClock};
use replug_engine::{Broker, Controller, WorkerPool};
use replug_pipeline::Pipeline;
use replug_store::JobStore;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reap cadence for outputs, workspaces, and expired job records.
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The assembled daemon: router plus background machinery.
pub struct App {
    pub state: AppState,
    pub artifacts: Arc<ArtifactStore>,
    broker: Broker,
    pool: WorkerPool,
    shutdown: CancellationToken,
    reaper: tokio::task::JoinHandle<()>,
}

/// Build every component, run startup recovery, and spawn the background
/// tasks. Returns the HTTP router and the app handle for shutdown.
pub async fn start(config: &Config) -> anyhow::Result<(axum::Router, App)> {
    let clock = SystemClock;
    let data_root = config.data_root();
    std::fs::create_dir_all(&data_root)?;

    let store = Arc::new(JobStore::open(
        &data_root.join("store"),
        config.store_config(),
        clock.epoch_ms(),
    )?);
    let artifacts = Arc::new(ArtifactStore::new(&data_root, config.artifact_config())?);
    let bus = EventBus::new(Arc::clone(&store), config.bus_config());
    let broker = Broker::new(config.broker_config());
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        config.pipeline_config(),
    )?);
    let controller = Arc::new(Controller::new(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        broker.clone(),
        config.controller_config(),
        clock.clone(),
    ));

    recover(&store, &artifacts, &broker, &clock).await?;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::spawn(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        pipeline,
        broker.clone(),
        config.worker_config(),
        clock.clone(),
        shutdown.clone(),
    );

    let reaper = spawn_reaper(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        clock.clone(),
        shutdown.clone(),
    );

    let state = AppState {
        controller,
        store,
        bus,
        heartbeat: config.heartbeat(),
    };
    let router = routes::router(state.clone(), config.size_cap_bytes as usize);
    Ok((router, App { state, artifacts, broker, pool, shutdown, reaper }))
}

/// Restore artifact deadlines, fail jobs interrupted by the restart, and
/// re-enqueue pending ones.
async fn recover(
    store: &Arc<JobStore>,
    artifacts: &Arc<ArtifactStore>,
    broker: &Broker,
    clock: &SystemClock,
) -> anyhow::Result<()> {
    let missing = artifacts.restore(&store.jobs_with_output()).await?;
    for id in missing {
        tracing::warn!(%id, "output file lost across restart, clearing descriptor");
        store.clear_output(&id, clock.epoch_ms())?;
    }

    for (id, status) in store.non_terminal_ids() {
        match status {
            JobStatus::Pending => {
                if let Err(e) = broker.enqueue(id) {
                    tracing::warn!(%id, %e, "could not re-enqueue pending job");
                }
            }
            _ => {
                tracing::warn!(%id, %status, "failing job interrupted by restart");
                let patch = JobPatch::failed(
                    ErrorCode::InternalError,
                    "interrupted by service restart",
                );
                if let Err(e) = store.update(&id, patch, clock.epoch_ms()) {
                    tracing::warn!(%id, %e, "could not fail interrupted job");
                }
                if let Err(e) = artifacts.release_workspace(&id).await {
                    tracing::warn!(%id, %e, "could not release interrupted workspace");
                }
            }
        }
    }
    Ok(())
}

fn spawn_reaper(
    store: Arc<JobStore>,
    artifacts: Arc<ArtifactStore>,
    clock: SystemClock,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                () = shutdown.cancelled() => break,
            }
            reap_once(&store, &artifacts, &clock).await;
        }
    })
}

/// One pass of the reapers: expired outputs, orphaned workspaces, and
/// job records past their TTL.
pub async fn reap_once(store: &JobStore, artifacts: &ArtifactStore, clock: &SystemClock) {
    let now = clock.epoch_ms();

    let live: Vec<_> = store.non_terminal_ids().into_iter().map(|(id, _)| id).collect();
    match artifacts.reap(now, &live).await {
        Ok(reaped) => {
            for id in reaped {
                if let Err(e) = store.clear_output(&id, now) {
                    tracing::warn!(%id, %e, "could not clear reaped output descriptor");
                }
            }
        }
        Err(e) => tracing::warn!(%e, "artifact reap failed"),
    }

    match store.expire(now) {
        Ok(expired) => {
            if !expired.is_empty() {
                // Files still on disk stay until their own retention
                // deadline; the tombstone alone already 404s downloads.
                tracing::info!(count = expired.len(), "job records tombstoned");
            }
        }
        Err(e) => tracing::warn!(%e, "job expiry failed"),
    }
}

impl App {
    /// Graceful shutdown: stop claiming, drain workers, stop the reaper.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.shutdown.cancel();
        self.broker.close();
        self.pool.join().await;
        self.reaper.abort();
    }
}
