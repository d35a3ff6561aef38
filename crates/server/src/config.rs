// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon configuration, loaded once at startup.

use clap::Parser;
use replug_artifacts::ArtifactConfig;
use replug_bus::BusConfig;
use replug_engine::{BrokerConfig, ControllerConfig, WorkerConfig, DEFAULT_PLATFORMS};
use replug_pipeline::PipelineConfig;
use replug_store::StoreConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// replugd: Dify plugin repackaging service.
#[derive(Debug, Clone, Parser)]
#[command(name = "replugd", version, about)]
pub struct Config {
    /// Listen address for the HTTP API and WebSocket gateway
    #[arg(long, env = "REPLUG_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// Data root (journal, workspaces, outputs, logs)
    #[arg(long, env = "REPLUG_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Concurrent repackaging workers (default: CPU count)
    #[arg(long, env = "REPLUG_WORKERS")]
    pub workers: Option<usize>,

    /// Queue depth above which job creation is refused
    #[arg(long, env = "REPLUG_QUEUE_HIGH_WATER", default_value_t = 100)]
    pub queue_high_water: usize,

    /// Download (and upload) size cap in bytes
    #[arg(long, env = "REPLUG_SIZE_CAP_BYTES", default_value_t = 500 * 1024 * 1024)]
    pub size_cap_bytes: u64,

    /// Total download duration cap in seconds
    #[arg(long, env = "REPLUG_FETCH_TIMEOUT_SECS", default_value_t = 600)]
    pub fetch_timeout_secs: u64,

    /// Per-stage deadline in seconds
    #[arg(long, env = "REPLUG_STAGE_TIMEOUT_SECS", default_value_t = 600)]
    pub stage_timeout_secs: u64,

    /// How long completed outputs stay downloadable, in hours
    #[arg(long, env = "REPLUG_RETENTION_TTL_HOURS", default_value_t = 24)]
    pub retention_ttl_hours: u64,

    /// How long job records survive before tombstoning, in hours
    #[arg(long, env = "REPLUG_JOB_TTL_HOURS", default_value_t = 24)]
    pub job_ttl_hours: u64,

    /// Retained events per job
    #[arg(long, env = "REPLUG_EVENT_RETENTION", default_value_t = 256)]
    pub event_retention: usize,

    /// WebSocket heartbeat interval in seconds
    #[arg(long, env = "REPLUG_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Grace period between TERM and KILL for subprocess groups, seconds
    #[arg(long, env = "REPLUG_KILL_GRACE_SECS", default_value_t = 10)]
    pub kill_grace_secs: u64,

    /// Packaging tool (pip-compatible argv contract)
    #[arg(long, env = "REPLUG_PACKAGING_TOOL", default_value = "pip")]
    pub packaging_tool: PathBuf,

    /// Plugin-archive tool (default: dify-plugin-<os>-<arch> on PATH)
    #[arg(long, env = "REPLUG_ARCHIVE_TOOL")]
    pub archive_tool: Option<PathBuf>,

    /// Package index mirror passed to the packaging tool
    #[arg(long, env = "REPLUG_MIRROR_URL")]
    pub mirror_url: Option<String>,

    /// Marketplace base URL for coordinate downloads
    #[arg(long, env = "REPLUG_MARKETPLACE_URL", default_value = "https://marketplace.dify.ai")]
    pub marketplace_url: String,

    /// Minimum free disk space (bytes) to admit work
    #[arg(long, env = "REPLUG_MIN_FREE_BYTES", default_value_t = 1024 * 1024 * 1024)]
    pub min_free_bytes: u64,

    /// Accepted target platform tags (comma separated; default allowlist
    /// when empty)
    #[arg(long, env = "REPLUG_PLATFORMS", value_delimiter = ',')]
    pub platforms: Vec<String>,
}

impl Config {
    /// Resolved data root: flag/env, else the platform-local data dir.
    pub fn data_root(&self) -> PathBuf {
        self.data_root.clone().unwrap_or_else(|| {
            dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")).join("replug")
        })
    }

    /// Archive tool path: explicit, else the host-selected binary name.
    pub fn archive_tool(&self) -> PathBuf {
        self.archive_tool.clone().unwrap_or_else(|| {
            let os = match std::env::consts::OS {
                "macos" => "darwin",
                other => other,
            };
            let arch = match std::env::consts::ARCH {
                "x86_64" => "amd64",
                "aarch64" => "arm64",
                other => other,
            };
            PathBuf::from(format!("dify-plugin-{os}-{arch}"))
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            job_ttl: Duration::from_secs(self.job_ttl_hours * 3600),
            event_retention: self.event_retention,
            ..StoreConfig::default()
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig { buffer: self.event_retention, ..BusConfig::default() }
    }

    pub fn artifact_config(&self) -> ArtifactConfig {
        ArtifactConfig {
            retention_ttl: Duration::from_secs(self.retention_ttl_hours * 3600),
            min_free_bytes: self.min_free_bytes,
            ..ArtifactConfig::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            packaging_tool: self.packaging_tool.clone(),
            archive_tool: self.archive_tool(),
            marketplace_base: self.marketplace_url.clone(),
            mirror_url: self.mirror_url.clone(),
            size_cap: self.size_cap_bytes,
            fetch_time_cap: Duration::from_secs(self.fetch_timeout_secs),
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig { high_water: self.queue_high_water }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let mut cfg = WorkerConfig::default();
        if let Some(workers) = self.workers {
            cfg.workers = workers.max(1);
        }
        cfg
    }

    pub fn controller_config(&self) -> ControllerConfig {
        let platforms = if self.platforms.is_empty() {
            DEFAULT_PLATFORMS.iter().map(|s| s.to_string()).collect()
        } else {
            self.platforms.clone()
        };
        ControllerConfig {
            platforms,
            upload_size_cap: self.size_cap_bytes,
            ..ControllerConfig::default()
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
