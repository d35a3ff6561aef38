// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::broker::BrokerConfig;
use replug_core::FakeClock;
use replug_store::StoreConfig;

struct Fixture {
    controller: Controller<FakeClock>,
    store: Arc<JobStore>,
    broker: Broker,
    #[allow(dead_code)]
    dir: tempfile::TempDir,
}

fn fixture_with(broker_cfg: BrokerConfig, cfg: ControllerConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        JobStore::open(&dir.path().join("store"), StoreConfig::default(), 1_000_000).unwrap(),
    );
    let artifacts = Arc::new(
        replug_artifacts::ArtifactStore::new(
            dir.path(),
            replug_artifacts::ArtifactConfig::default(),
        )
        .unwrap(),
    );
    let broker = Broker::new(broker_cfg);
    let controller = Controller::new(
        Arc::clone(&store),
        artifacts,
        broker.clone(),
        cfg,
        FakeClock::new(),
    );
    Fixture { controller, store, broker, dir }
}

fn fixture() -> Fixture {
    fixture_with(BrokerConfig::default(), ControllerConfig::default())
}

#[tokio::test]
async fn url_create_validates_and_enqueues() {
    let fx = fixture();
    let job = fx
        .controller
        .create_url(
            "https://host/x.difypkg".to_string(),
            Some("manylinux2014_x86_64".to_string()),
            None,
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.suffix, "offline");
    assert_eq!(fx.broker.depth(), 1);
}

#[tokio::test]
async fn bad_scheme_is_rejected_without_creating_a_job() {
    let fx = fixture();
    let err = fx
        .controller
        .create_url("ftp://host/x.difypkg".to_string(), None, None)
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::InvalidArgument);
    assert!(fx.store.list_recent(10).is_empty());
    assert_eq!(fx.broker.depth(), 0);
}

#[yare::parameterized(
    unknown_platform = { Some("atari2600"), None },
    bad_suffix = { None, Some("no spaces allowed") },
)]
fn invalid_tunables_rejected(platform: Option<&str>, suffix: Option<&str>) {
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(async {
        let fx = fixture();
        let err = fx
            .controller
            .create_url(
                "https://host/x.difypkg".to_string(),
                platform.map(str::to_string),
                suffix.map(str::to_string),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert!(fx.store.list_recent(10).is_empty());
    });
}

#[tokio::test]
async fn marketplace_create_carries_coordinate() {
    let fx = fixture();
    let job = fx
        .controller
        .create_marketplace(
            "langgenius".to_string(),
            "agent".to_string(),
            "0.0.9".to_string(),
            None,
            Some("air-gapped".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(job.suffix, "air-gapped");
    match job.origin {
        Origin::Marketplace { ref author, ref name, ref version } => {
            assert_eq!((author.as_str(), name.as_str(), version.as_str()), ("langgenius", "agent", "0.0.9"));
        }
        ref other => panic!("unexpected origin {other:?}"),
    }
}

#[tokio::test]
async fn upload_stages_the_handoff_file() {
    let fx = fixture();
    let job = fx
        .controller
        .create_upload("plugin.difypkg".to_string(), vec![1, 2, 3], None, None)
        .await
        .unwrap();

    // The staged bytes are waiting at the handoff path for the pipeline.
    let staged = fx.dir.path().join("work/uploads").join(job.id.as_str());
    assert_eq!(std::fs::read(staged).unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn upload_size_cap_is_enforced() {
    let fx = fixture_with(
        BrokerConfig::default(),
        ControllerConfig { upload_size_cap: 8, ..ControllerConfig::default() },
    );
    let err = fx
        .controller
        .create_upload("plugin.difypkg".to_string(), vec![0u8; 16], None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn upload_must_be_a_difypkg() {
    let fx = fixture();
    let err = fx
        .controller
        .create_upload("plugin.zip".to_string(), vec![1], None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn saturated_queue_refuses_admission() {
    let fx = fixture_with(BrokerConfig { high_water: 1 }, ControllerConfig::default());
    fx.controller
        .create_url("https://host/a.difypkg".to_string(), None, None)
        .await
        .unwrap();

    let err = fx
        .controller
        .create_url("https://host/b.difypkg".to_string(), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Overloaded);
    // Refused at the edge: no second job record exists.
    assert_eq!(fx.store.list_recent(10).len(), 1);
}

#[tokio::test]
async fn closed_queue_fails_the_created_job() {
    let fx = fixture();
    fx.broker.close();

    let err = fx
        .controller
        .create_url("https://host/x.difypkg".to_string(), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::Overloaded);

    // The job record exists and observably failed.
    let jobs = fx.store.list_recent(10);
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error.as_deref().is_some_and(|e| e.contains("queue unavailable")));
}

#[tokio::test]
async fn list_limits_are_clamped() {
    let fx = fixture_with(
        BrokerConfig { high_water: 1000 },
        ControllerConfig { list_limit_max: 2, ..ControllerConfig::default() },
    );
    for i in 0..4 {
        fx.controller
            .create_url(format!("https://host/{i}.difypkg"), None, None)
            .await
            .unwrap();
    }
    assert_eq!(fx.controller.list_recent(100).len(), 2);
}

#[tokio::test]
async fn cancel_maps_store_outcomes() {
    let fx = fixture();
    let job = fx
        .controller
        .create_url("https://host/x.difypkg".to_string(), None, None)
        .await
        .unwrap();

    assert_eq!(fx.controller.cancel(&job.id).unwrap(), CancelOutcome::Cancelled);
    let err = fx.controller.cancel(&job.id).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
}

#[tokio::test]
async fn download_of_unfinished_job_is_not_found() {
    let fx = fixture();
    let job = fx
        .controller
        .create_url("https://host/x.difypkg".to_string(), None, None)
        .await
        .unwrap();

    let err = fx.controller.open_output(&job.id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotFound);
}
