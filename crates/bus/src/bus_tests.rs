// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use replug_core::test_support::url_origin;
use replug_core::{ErrorCode, JobPatch, JobStatus};
use replug_store::StoreConfig;
use std::time::Duration;

fn fixture(dir: &std::path::Path, cfg: BusConfig) -> (Arc<JobStore>, EventBus, JobId) {
    let store = Arc::new(JobStore::open(dir, StoreConfig::default(), 1_000_000).unwrap());
    let bus = EventBus::new(Arc::clone(&store), cfg);
    let job = store.create(url_origin("x"), None, "offline".into(), 1_000_000).unwrap();
    (store, bus, job.id)
}

fn tick(store: &JobStore, id: &JobId, status: JobStatus, at: u64) {
    store.update(id, JobPatch::new().status(status), at).unwrap();
}

#[tokio::test]
async fn live_events_arrive_in_sequence_order() {
    let dir = tempfile::tempdir().unwrap();
    let (store, bus, id) = fixture(dir.path(), BusConfig::default());

    let mut sub = bus.subscribe(id, 0).unwrap();
    tick(&store, &id, JobStatus::Downloading, 1_000_001);
    tick(&store, &id, JobStatus::Processing, 1_000_002);

    let a = sub.recv().await.unwrap();
    let b = sub.recv().await.unwrap();
    assert_eq!((a.seq, b.seq), (1, 2));
}

#[tokio::test]
async fn replay_precedes_live_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let (store, bus, id) = fixture(dir.path(), BusConfig::default());

    tick(&store, &id, JobStatus::Downloading, 1_000_001);
    tick(&store, &id, JobStatus::Processing, 1_000_002);

    let mut sub = bus.subscribe(id, 0).unwrap();
    tick(&store, &id, JobStatus::Completed, 1_000_003);

    let seqs = [
        sub.recv().await.unwrap().seq,
        sub.recv().await.unwrap().seq,
        sub.recv().await.unwrap().seq,
    ];
    assert_eq!(seqs, [1, 2, 3]);
}

#[tokio::test]
async fn since_seq_skips_already_seen_events() {
    let dir = tempfile::tempdir().unwrap();
    let (store, bus, id) = fixture(dir.path(), BusConfig::default());

    tick(&store, &id, JobStatus::Downloading, 1_000_001);
    tick(&store, &id, JobStatus::Processing, 1_000_002);

    let mut sub = bus.subscribe(id, 1).unwrap();
    assert_eq!(sub.recv().await.unwrap().seq, 2);
}

#[tokio::test]
async fn terminal_finishes_the_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (store, bus, id) = fixture(dir.path(), BusConfig::default());
    let mut sub = bus.subscribe(id, 0).unwrap();

    tick(&store, &id, JobStatus::Downloading, 1_000_001);
    store
        .update(&id, JobPatch::failed(ErrorCode::FetchFailed, "boom"), 1_000_002)
        .unwrap();

    assert!(!sub.recv().await.unwrap().body.is_terminal());
    let terminal = sub.recv().await.unwrap();
    assert!(terminal.body.is_terminal());
    assert_eq!(sub.recv().await, Err(Closed::Finished));
}

#[tokio::test]
async fn unknown_job_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, bus, _) = fixture(dir.path(), BusConfig::default());
    assert!(matches!(bus.subscribe("job-nope".into(), 0), Err(BusError::UnknownJob(_))));
}

#[tokio::test]
async fn overflow_drops_oldest_and_inserts_gap_marker() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = BusConfig { buffer: 4, ..BusConfig::default() };
    let (store, bus, id) = fixture(dir.path(), cfg);
    let mut sub = bus.subscribe(id, 0).unwrap();

    // Publish 8 log events without draining: buffer of 4 keeps the newest
    // tail with a gap marker in front of it.
    for i in 0..8 {
        store
            .publish_event(&id, replug_core::EventBody::Log { line: format!("l{i}") }, 1_000_001)
            .unwrap();
    }

    let first = sub.recv().await.unwrap();
    match first.body {
        replug_core::EventBody::Gap { dropped } => assert!(dropped >= 4),
        ref other => panic!("expected gap, got {other:?}"),
    }
    // Remaining events still arrive in order.
    let mut last = 0;
    for _ in 0..3 {
        let ev = sub.recv().await.unwrap();
        assert!(ev.seq > last);
        last = ev.seq;
    }
    assert_eq!(last, 8);
}

#[tokio::test]
async fn slow_consumer_is_disconnected_but_prompt_one_unaffected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = BusConfig {
        buffer: 4,
        publish_timeout: Duration::from_millis(50),
        ..BusConfig::default()
    };
    let (store, bus, id) = fixture(dir.path(), cfg);

    let mut slow = bus.subscribe(id, 0).unwrap();
    let mut prompt = bus.subscribe(id, 0).unwrap();

    let prompt_task = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Ok(ev) = prompt.recv().await {
            events.push(ev);
        }
        events
    });

    tick(&store, &id, JobStatus::Downloading, 1_000_001);
    tick(&store, &id, JobStatus::Processing, 1_000_002);
    tick(&store, &id, JobStatus::Completed, 1_000_003);

    // The prompt subscriber sees everything, terminal included.
    let events = prompt_task.await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(events.last().is_some_and(|e| e.body.is_terminal()));

    // The slow subscriber never drained; after the publish timeout it is
    // closed as a slow consumer.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(slow.recv().await, Err(Closed::SlowConsumer));
}

#[tokio::test]
async fn drop_unsubscribes() {
    let dir = tempfile::tempdir().unwrap();
    let (_store, bus, id) = fixture(dir.path(), BusConfig::default());

    let sub = bus.subscribe(id, 0).unwrap();
    let other = bus.subscribe(id, 0).unwrap();
    assert_eq!(bus.subscriber_count(&id), 2);

    drop(sub);
    assert_eq!(bus.subscriber_count(&id), 1);
    drop(other);
    assert_eq!(bus.subscriber_count(&id), 0);
}

#[tokio::test]
async fn ack_advances_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let (store, bus, id) = fixture(dir.path(), BusConfig::default());
    let mut sub = bus.subscribe(id, 0).unwrap();

    tick(&store, &id, JobStatus::Downloading, 1_000_001);
    let ev = sub.recv().await.unwrap();
    sub.ack(ev.seq);
    // Advisory only: delivery continues normally.
    tick(&store, &id, JobStatus::Processing, 1_000_002);
    assert_eq!(sub.recv().await.unwrap().seq, 2);
}
