// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios against a full in-process daemon: HTTP admission,
//! worker pipeline with stub external tools, WebSocket progress, download,
//! cancellation, and retention expiry.

mod support;

use futures_util::{SinkExt, StreamExt};
use support::{plugin_zip, TestServer};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

/// Scenario: create by URL, watch it complete, download the output.
#[tokio::test]
async fn happy_url_path() {
    let server = TestServer::spawn(|_| {}).await;
    let source = support::serve_bytes(plugin_zip(), "application/octet-stream").await;

    let created: serde_json::Value = server
        .post_json(
            "/tasks",
            serde_json::json!({
                "url": format!("{source}/x.difypkg"),
                "platform": "manylinux2014_x86_64",
                "suffix": "offline",
            }),
        )
        .await;
    let id = created["task_id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "pending");

    let job = server.wait_terminal(&id).await;
    assert_eq!(job["status"], "completed", "{job}");
    assert_eq!(job["progress"], 100);
    assert_eq!(job["output"]["filename"], "x-offline.difypkg");
    assert!(job["output"]["sha256"].as_str().is_some_and(|h| h.len() == 64));

    // Download streams the bytes back with an attachment disposition.
    let response = server.get(&format!("/tasks/{id}/download")).await;
    assert_eq!(response.status().as_u16(), 200);
    let disposition = response
        .headers()
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    assert_eq!(disposition, "attachment; filename=\"x-offline.difypkg\"");
    let bytes = response.bytes().await.unwrap();
    assert!(!bytes.is_empty());
}

/// Scenario: marketplace coordinate; metadata comes from the manifest and
/// the filename stem from the archive's inner name.
#[tokio::test]
async fn marketplace_happy_path() {
    let source = support::serve_bytes(plugin_zip(), "application/octet-stream").await;
    let server = TestServer::spawn(move |config| {
        config.marketplace_url = source.clone();
    })
    .await;

    let created: serde_json::Value = server
        .post_json(
            "/tasks/marketplace",
            serde_json::json!({
                "author": "langgenius",
                "name": "agent",
                "version": "0.0.9",
            }),
        )
        .await;
    let id = created["task_id"].as_str().unwrap().to_string();

    let job = server.wait_terminal(&id).await;
    assert_eq!(job["status"], "completed", "{job}");
    assert_eq!(job["plugin"]["name"], "agent");
    assert_eq!(job["plugin"]["author"], "langgenius");
    assert_eq!(job["plugin"]["version"], "0.0.9");
    assert_eq!(job["output"]["filename"], "agent-0.0.9-offline.difypkg");

    // The completed view lists it.
    let files: serde_json::Value = server.get_json("/files?limit=10").await;
    assert!(files.as_array().unwrap().iter().any(|t| t["task_id"] == id.as_str()));
}

/// Scenario: invalid scheme is rejected at admission with no job record.
#[tokio::test]
async fn invalid_url_rejected_at_admission() {
    let server = TestServer::spawn(|_| {}).await;

    let response = server
        .post_json_raw("/tasks", serde_json::json!({ "url": "ftp://host/x.difypkg" }))
        .await;
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "invalid_argument");

    let tasks: serde_json::Value = server.get_json("/tasks?limit=10").await;
    assert!(tasks.as_array().unwrap().is_empty());
}

/// Scenario: cancel during a trickling fetch; terminal within 10 s, the
/// workspace is removed, and no output exists.
#[tokio::test]
async fn cancellation_during_fetch() {
    let server = TestServer::spawn(|_| {}).await;
    let source = support::serve_trickle().await;

    let created: serde_json::Value = server
        .post_json("/tasks", serde_json::json!({ "url": format!("{source}/slow.difypkg") }))
        .await;
    let id = created["task_id"].as_str().unwrap().to_string();

    // Let the fetch start, then cancel.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let response = server.delete(&format!("/tasks/{id}")).await;
    assert!(response.status().is_success());

    let started = std::time::Instant::now();
    let job = server.wait_terminal(&id).await;
    assert_eq!(job["status"], "cancelled", "{job}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(job.get("output").is_none());
    assert!(!server.data_root().join("work").join(&id).exists());
}

/// Scenario: after the retention TTL the tombstone keeps the status but
/// the output is gone and downloads 404.
#[tokio::test]
async fn output_retention_expiry() {
    let source = support::serve_bytes(plugin_zip(), "application/octet-stream").await;
    // Zero retention: outputs expire as soon as the reaper looks.
    let server = TestServer::spawn(|config| {
        config.retention_ttl_hours = 0;
    })
    .await;

    let created: serde_json::Value = server
        .post_json("/tasks", serde_json::json!({ "url": format!("{source}/x.difypkg") }))
        .await;
    let id = created["task_id"].as_str().unwrap().to_string();
    let job = server.wait_terminal(&id).await;
    assert_eq!(job["status"], "completed", "{job}");

    server.reap().await;

    let job: serde_json::Value = server.get_json(&format!("/tasks/{id}")).await;
    assert_eq!(job["status"], "completed");
    assert!(job.get("output").is_none(), "descriptor must be cleared: {job}");

    let response = server.get(&format!("/tasks/{id}/download")).await;
    assert_eq!(response.status().as_u16(), 404);
}

/// Scenario: multipart upload runs the same pipeline downstream.
#[tokio::test]
async fn upload_round_trip() {
    let server = TestServer::spawn(|_| {}).await;

    let part = reqwest::multipart::Part::bytes(plugin_zip())
        .file_name("uploaded-agent.difypkg")
        .mime_str("application/octet-stream")
        .unwrap();
    let form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("suffix", "offline");

    let response = reqwest::Client::new()
        .post(format!("{}/tasks/upload", server.base()))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let created: serde_json::Value = response.json().await.unwrap();
    let id = created["task_id"].as_str().unwrap().to_string();

    let job = server.wait_terminal(&id).await;
    assert_eq!(job["status"], "completed", "{job}");
    assert_eq!(job["output"]["filename"], "uploaded-agent-offline.difypkg");
}

/// WebSocket stream: events arrive in gap-free sequence order, exactly one
/// terminal event last, and a reconnect with `since_seq` replays only the
/// missed tail.
#[tokio::test]
async fn websocket_stream_and_replay() {
    let server = TestServer::spawn(|_| {}).await;
    let source = support::serve_bytes(plugin_zip(), "application/octet-stream").await;

    let created: serde_json::Value = server
        .post_json("/tasks", serde_json::json!({ "url": format!("{source}/x.difypkg") }))
        .await;
    let id = created["task_id"].as_str().unwrap().to_string();

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&id, None))
        .await
        .expect("ws connect");

    let mut seqs: Vec<u64> = Vec::new();
    let mut terminal: Option<serde_json::Value> = None;
    while terminal.is_none() {
        let message = tokio::time::timeout(Duration::from_secs(30), ws.next())
            .await
            .expect("ws stream stalled")
            .expect("ws stream ended early")
            .expect("ws frame error");
        let Message::Text(text) = message else { continue };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        match frame["type"].as_str() {
            Some("heartbeat") | Some("pong") => continue,
            Some("terminal") => {
                seqs.push(frame["seq"].as_u64().unwrap());
                terminal = Some(frame);
            }
            Some(_) => {
                let seq = frame["seq"].as_u64().unwrap();
                if seq > 0 {
                    seqs.push(seq);
                }
            }
            None => panic!("untyped frame: {frame}"),
        }
    }

    // Gap-free, in order, terminal last.
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected, "sequence numbers must be 1..n in order");
    let terminal = terminal.unwrap();
    assert_eq!(terminal["status"], "completed");
    assert_eq!(terminal["output"]["filename"], "x-offline.difypkg");

    // Reconnect from the middle: only the tail replays, ending in the same
    // terminal event.
    let since = seqs[seqs.len() / 2];
    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&id, Some(since)))
        .await
        .expect("ws reconnect");
    let mut replayed: Vec<u64> = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("replay stalled")
            .expect("replay ended early")
            .expect("replay frame error");
        match message {
            Message::Text(text) => {
                let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
                if let Some(seq) = frame["seq"].as_u64().filter(|s| *s > 0) {
                    replayed.push(seq);
                }
                if frame["type"] == "terminal" {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    assert_eq!(replayed.first().copied(), Some(since + 1));
    assert_eq!(replayed.last().copied(), seqs.last().copied());
}

/// Two subscribers on one job: the prompt one sees everything even though
/// the other keeps its own pace.
#[tokio::test]
async fn second_subscriber_does_not_disturb_the_first() {
    let server = TestServer::spawn(|_| {}).await;
    let source = support::serve_bytes(plugin_zip(), "application/octet-stream").await;

    let created: serde_json::Value = server
        .post_json("/tasks", serde_json::json!({ "url": format!("{source}/x.difypkg") }))
        .await;
    let id = created["task_id"].as_str().unwrap().to_string();

    let (mut prompt, _) =
        tokio_tungstenite::connect_async(server.ws_url(&id, None)).await.unwrap();
    // The second subscriber connects and sends a ping but never reads
    // progress frames until the end.
    let (mut lagging, _) =
        tokio_tungstenite::connect_async(server.ws_url(&id, None)).await.unwrap();
    lagging.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();

    let mut saw_terminal = false;
    while !saw_terminal {
        let message = tokio::time::timeout(Duration::from_secs(30), prompt.next())
            .await
            .expect("prompt subscriber stalled")
            .expect("prompt stream ended early")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
            saw_terminal = frame["type"] == "terminal";
        }
    }

    let job = server.wait_terminal(&id).await;
    assert_eq!(job["status"], "completed");
}
