// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use replug_artifacts::ArtifactConfig;
use replug_core::{EventBody, FakeClock, Origin};
use replug_store::StoreConfig;
use std::io::Write as _;

const MANIFEST_YAML: &str = "\
name: agent
author: langgenius
version: 0.0.9
description: test plugin
";

struct Fixture {
    store: Arc<JobStore>,
    artifacts: Arc<ArtifactStore>,
    pipeline: Pipeline,
    clock: FakeClock,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
}

fn write_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

fn write_plugin_zip(path: &Path) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let opts = zip::write::SimpleFileOptions::default();
    for (name, body) in [
        ("manifest.yaml", MANIFEST_YAML),
        ("requirements.txt", "requests==2.31.0\n"),
        (".difyignore", "wheels/\n.env\n"),
    ] {
        zip.start_file(name, opts).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap();
}

/// Stub tools: the packaging tool drops a wheel, the archive tool zips
/// nothing but produces the expected output file.
fn fixture_with_tools(packaging: &str, archive: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        JobStore::open(&dir.path().join("store"), StoreConfig::default(), 1_000_000).unwrap(),
    );
    let artifacts =
        Arc::new(ArtifactStore::new(dir.path(), ArtifactConfig::default()).unwrap());

    let cfg = PipelineConfig {
        packaging_tool: write_tool(dir.path(), "pip-stub", packaging),
        archive_tool: write_tool(dir.path(), "dify-plugin-stub", archive),
        stage_timeout: Duration::from_secs(10),
        kill_grace: Duration::from_millis(200),
        ..PipelineConfig::default()
    };
    let pipeline = Pipeline::new(Arc::clone(&store), Arc::clone(&artifacts), cfg).unwrap();
    Fixture { store, artifacts, pipeline, clock: FakeClock::new(), dir }
}

fn fixture() -> Fixture {
    fixture_with_tools(
        "touch wheels/requests.whl; echo 'Collecting requests'",
        // $0 plugin package <dir> -o <out>
        "printf 'repacked-bytes' > \"$5\"",
    )
}

async fn upload_job(fx: &Fixture, filename: &str) -> JobId {
    let job = fx
        .store
        .create(
            Origin::Upload { filename: filename.to_string() },
            None,
            "offline".to_string(),
            fx.clock.epoch_ms(),
        )
        .unwrap();
    let staged = fx.artifacts.upload_path(&job.id);
    let tmp = staged.with_extension("zip");
    write_plugin_zip(&tmp);
    tokio::fs::rename(&tmp, &staged).await.unwrap();
    job.id
}

#[tokio::test]
async fn upload_job_runs_to_completion() {
    let fx = fixture();
    let id = upload_job(&fx, "agent.difypkg").await;

    fx.pipeline.run(id, CancellationToken::new(), &fx.clock).await.unwrap();

    let job = fx.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    let output = job.output.expect("completed job must carry an output descriptor");
    assert_eq!(output.filename, "agent-offline.difypkg");
    assert!(output.size > 0);
    assert_eq!(output.sha256.len(), 64);

    // Plugin metadata was read from the manifest.
    let plugin = job.plugin.expect("metadata populated by inspect");
    assert_eq!(plugin.name, "agent");
    assert_eq!(plugin.author, "langgenius");
    assert_eq!(plugin.version, "0.0.9");

    // Workspace is gone, output is downloadable.
    assert!(!fx.artifacts.workspace_path(&id).exists());
    assert!(fx
        .artifacts
        .open_output(&id, "agent-offline.difypkg", fx.clock.epoch_ms())
        .await
        .is_ok());

    // Event stream: at least one event per stage, exactly one terminal.
    let events = fx.store.events_since(&id, 0);
    let terminals = events.iter().filter(|e| e.body.is_terminal()).count();
    assert_eq!(terminals, 1);
    assert!(events.last().is_some_and(|e| e.body.is_terminal()));
    for stage in ["fetch", "inspect", "resolve", "rewrite", "repack"] {
        assert!(
            events.iter().any(|e| matches!(
                &e.body,
                EventBody::Status { stage: s, .. } if s == stage
            )),
            "missing stage event: {stage}"
        );
    }
}

#[tokio::test]
async fn progress_is_monotone_across_the_run() {
    let fx = fixture();
    let id = upload_job(&fx, "agent.difypkg").await;
    fx.pipeline.run(id, CancellationToken::new(), &fx.clock).await.unwrap();

    let mut last = 0u8;
    for event in fx.store.events_since(&id, 0) {
        if let EventBody::Status { progress, .. } = event.body {
            assert!(progress >= last, "progress regressed: {progress} < {last}");
            last = progress;
        }
    }
    assert_eq!(last, 100);
}

#[tokio::test]
async fn resolution_failure_classifies_and_preserves_workspace() {
    let fx = fixture_with_tools(
        "echo 'ERROR: connection to mirror.example timed out' 1>&2; exit 1",
        "true",
    );
    let id = upload_job(&fx, "agent.difypkg").await;

    let err = fx.pipeline.run(id, CancellationToken::new(), &fx.clock).await.unwrap_err();
    assert_eq!(err.code, replug_core::ErrorCode::DependencyResolutionFailed);
    assert!(err.transient);

    // Terminal bookkeeping is the worker's call; the workspace stays for a
    // possible resume.
    assert!(!fx.store.get(&id).unwrap().is_terminal());
    assert!(fx.artifacts.workspace_path(&id).exists());

    // Tool output reached the event stream as log lines.
    let events = fx.store.events_since(&id, 0);
    assert!(events.iter().any(|e| matches!(
        &e.body,
        EventBody::Log { line } if line.contains("timed out")
    )));
}

#[tokio::test]
async fn cancellation_mid_resolve_terminates_and_cleans_up() {
    let fx = fixture_with_tools("sleep 30", "true");
    let id = upload_job(&fx, "agent.difypkg").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let start = std::time::Instant::now();
    let err = fx.pipeline.run(id, cancel, &fx.clock).await.unwrap_err();
    assert!(err.cancelled);
    assert!(start.elapsed() < Duration::from_secs(10));

    let job = fx.store.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.output.is_none());
    assert!(!fx.artifacts.workspace_path(&id).exists());

    let events = fx.store.events_since(&id, 0);
    assert!(events.last().is_some_and(|e| e.body.is_terminal()));
}

#[tokio::test]
async fn rerun_resumes_from_unfinished_stage() {
    // First attempt fails at resolve; flipping the tool to succeed and
    // re-running must not re-fetch or re-extract.
    let fx = fixture_with_tools("exit 1", "printf 'repacked-bytes' > \"$5\"");
    let id = upload_job(&fx, "agent.difypkg").await;
    fx.pipeline.run(id, CancellationToken::new(), &fx.clock).await.unwrap_err();

    let ws = fx.artifacts.workspace_path(&id);
    assert!(ws.join("input.difypkg").exists());
    assert!(ws.join("pkg/manifest.yaml").exists());

    // Upload handoff is gone (consumed by the first fetch); a resume that
    // re-ran fetch would fail on the missing handoff.
    write_tool(
        fx.dir.path(),
        "pip-stub",
        "touch wheels/requests.whl; echo 'Collecting requests'",
    );
    fx.pipeline.run(id, CancellationToken::new(), &fx.clock).await.unwrap();

    assert_eq!(fx.store.get(&id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn terminal_job_is_a_no_op() {
    let fx = fixture();
    let id = upload_job(&fx, "agent.difypkg").await;
    fx.store.cancel(&id, fx.clock.epoch_ms()).unwrap();

    // Claimed after cancellation: nothing to do, no error.
    fx.pipeline.run(id, CancellationToken::new(), &fx.clock).await.unwrap();
    assert_eq!(fx.store.get(&id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn publish_filename_falls_back_to_manifest_for_marketplace() {
    let fx = fixture();
    // Marketplace origins have no outer filename; simulate a fetched input
    // by pre-seeding the workspace.
    let job = fx
        .store
        .create(
            Origin::Marketplace {
                author: "langgenius".to_string(),
                name: "agent".to_string(),
                version: "0.0.9".to_string(),
            },
            None,
            "offline".to_string(),
            fx.clock.epoch_ms(),
        )
        .unwrap();
    let ws = fx.artifacts.allocate_workspace(&job.id).await.unwrap();
    write_plugin_zip(&ws.join("input.difypkg"));

    fx.pipeline.run(job.id, CancellationToken::new(), &fx.clock).await.unwrap();

    let done = fx.store.get(&job.id).unwrap();
    assert_eq!(
        done.output.map(|o| o.filename),
        Some("agent-0.0.9-offline.difypkg".to_string())
    );
}
