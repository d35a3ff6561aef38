// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process daemon harness and stub collaborators for the spec tests.

use clap::Parser as _;
use replug_core::SystemClock;
use replug_server::{lifecycle, App, Config};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A running daemon bound to an ephemeral port, with stub external tools.
pub struct TestServer {
    base: String,
    client: reqwest::Client,
    data_root: PathBuf,
    app: App,
    _dir: tempfile::TempDir,
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

impl TestServer {
    pub async fn spawn(mutate: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pip = write_tool(
            dir.path(),
            "pip-stub",
            "touch wheels/marker.whl; echo 'Collecting requests'",
        );
        // Argv contract: <tool> plugin package <dir> -o <out>
        let pack = write_tool(dir.path(), "pack-stub", "printf 'repacked-bytes' > \"$5\"");

        let data_root = dir.path().join("data");
        let mut config = Config::parse_from([
            "replugd",
            "--data-root",
            data_root.to_str().unwrap(),
            "--packaging-tool",
            pip.to_str().unwrap(),
            "--archive-tool",
            pack.to_str().unwrap(),
            "--workers",
            "2",
            "--heartbeat-secs",
            "1",
        ]);
        mutate(&mut config);

        let (router, app) = lifecycle::start(&config).await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            data_root,
            app,
            _dir: dir,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn ws_url(&self, id: &str, since_seq: Option<u64>) -> String {
        let base = self.base.replace("http://", "ws://");
        match since_seq {
            Some(seq) => format!("{base}/ws/tasks/{id}?since_seq={seq}"),
            None => format!("{base}/ws/tasks/{id}"),
        }
    }

    pub async fn post_json_raw(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn post_json(&self, path: &str, body: serde_json::Value) -> serde_json::Value {
        let response = self.post_json_raw(path, body).await;
        assert!(
            response.status().is_success(),
            "POST {path} failed: {}",
            response.status()
        );
        response.json().await.unwrap()
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(format!("{}{path}", self.base)).send().await.unwrap()
    }

    pub async fn get_json(&self, path: &str) -> serde_json::Value {
        let response = self.get(path).await;
        assert!(
            response.status().is_success(),
            "GET {path} failed: {}",
            response.status()
        );
        response.json().await.unwrap()
    }

    pub async fn delete(&self, path: &str) -> reqwest::Response {
        self.client.delete(format!("{}{path}", self.base)).send().await.unwrap()
    }

    /// Poll the job until it reaches a terminal status.
    pub async fn wait_terminal(&self, id: &str) -> serde_json::Value {
        for _ in 0..300 {
            let job = self.get_json(&format!("/tasks/{id}")).await;
            if matches!(
                job["status"].as_str(),
                Some("completed") | Some("failed") | Some("cancelled")
            ) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    /// Run one reaper pass synchronously.
    pub async fn reap(&self) {
        lifecycle::reap_once(&self.app.state.store, &self.app.artifacts, &SystemClock).await;
    }
}

/// A minimal plugin package: manifest, requirements, ignore list.
pub fn plugin_zip() -> Vec<u8> {
    let cursor = std::io::Cursor::new(Vec::new());
    let mut zip = zip::ZipWriter::new(cursor);
    let opts = zip::write::SimpleFileOptions::default();
    for (name, body) in [
        (
            "manifest.yaml",
            "name: agent\nauthor: langgenius\nversion: 0.0.9\ndescription: test plugin\n",
        ),
        ("requirements.txt", "requests==2.31.0\n"),
        (".difyignore", "wheels/\n.env\n"),
    ] {
        zip.start_file(name, opts).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// One-shot-per-connection HTTP server that answers every GET with the
/// same bytes. Returns the base URL.
pub async fn serve_bytes(body: Vec<u8>, content_type: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let content_type = content_type.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            let body = body.clone();
            let content_type = content_type.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(&body).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

/// HTTP server that trickles a huge body one byte at a time (for
/// cancellation tests). Returns the base URL.
pub async fn serve_trickle() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let head =
                    "HTTP/1.1 200 OK\r\nContent-Length: 10000000\r\nConnection: close\r\n\r\n";
                if sock.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                loop {
                    if sock.write_all(b"x").await.is_err() {
                        return;
                    }
                    let _ = sock.flush().await;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            });
        }
    });
    format!("http://{addr}")
}
