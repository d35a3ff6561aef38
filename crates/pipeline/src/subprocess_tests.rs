// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::path::PathBuf;

fn sh() -> PathBuf {
    PathBuf::from("/bin/sh")
}

fn args(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

async fn run(
    script: &str,
    cancel: &CancellationToken,
    timeout: Duration,
) -> (Result<ToolOutput, SubprocessError>, Vec<String>) {
    let dir = tempfile::tempdir().unwrap();
    let mut lines = Vec::new();
    let result = run_streamed(
        &sh(),
        &args(script),
        dir.path(),
        cancel,
        timeout,
        Duration::from_millis(200),
        |line| lines.push(line.to_string()),
    )
    .await;
    (result, lines)
}

#[tokio::test]
async fn captures_stdout_stderr_and_exit_code() {
    let cancel = CancellationToken::new();
    let (result, lines) =
        run("echo one; echo two 1>&2; exit 3", &cancel, Duration::from_secs(5)).await;

    let output = result.unwrap();
    assert_eq!(output.exit_code, 3);
    assert!(!output.success());
    assert!(lines.contains(&"one".to_string()));
    assert!(lines.contains(&"two".to_string()));
    assert!(output.tail.contains("one"));
    assert!(output.tail.contains("two"));
}

#[tokio::test]
async fn zero_exit_is_success() {
    let cancel = CancellationToken::new();
    let (result, _) = run("true", &cancel, Duration::from_secs(5)).await;
    assert!(result.unwrap().success());
}

#[tokio::test]
async fn timeout_kills_the_process_group() {
    let cancel = CancellationToken::new();
    let start = std::time::Instant::now();
    let (result, _) = run("sleep 30", &cancel, Duration::from_millis(300)).await;

    assert!(matches!(result, Err(SubprocessError::TimedOut(_))));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn cancellation_interrupts_promptly() {
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let start = std::time::Instant::now();
    let (result, _) = run("sleep 30", &cancel, Duration::from_secs(60)).await;

    assert!(matches!(result, Err(SubprocessError::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let result = run_streamed(
        Path::new("/nonexistent/replug-tool"),
        &[],
        dir.path(),
        &cancel,
        Duration::from_secs(1),
        Duration::from_millis(100),
        |_| {},
    )
    .await;
    assert!(matches!(result, Err(SubprocessError::Spawn { .. })));
}

#[test]
fn tail_keeps_the_newest_bytes() {
    let mut tail = Tail::new(16);
    tail.push("aaaaaaaaaa");
    tail.push("bbbbbbbbbb");
    let s = tail.into_string();
    assert!(s.len() <= 16);
    assert!(s.ends_with("bbbbbbbbbb"));
}
