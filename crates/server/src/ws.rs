// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket progress gateway.
//!
//! One task per connection: replays retained events, forwards live bus
//! events as framed JSON, heartbeats every H seconds, and closes after the
//! terminal event. Inbound `ping` gets a `pong`, `ack` advances the
//! subscription cursor, anything else is ignored. Connections with no
//! client traffic for 2×H are reaped; a broken socket never affects job
//! execution.

use crate::error::ApiError;
use crate::routes::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use replug_bus::Closed;
use replug_core::{
    Clock, ErrorCode, EventBody, Job, JobEvent, JobId, JobStatus, OutputInfo, PluginMeta,
    SystemClock,
};
use serde::{Deserialize, Serialize};

/// Frames sent to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Status {
        seq: u64,
        ts_ms: u64,
        status: JobStatus,
        progress: u8,
        stage: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        plugin: Option<PluginMeta>,
    },
    Log {
        seq: u64,
        ts_ms: u64,
        line: String,
    },
    Heartbeat {
        ts_ms: u64,
    },
    Pong {
        ts_ms: u64,
    },
    Terminal {
        seq: u64,
        ts_ms: u64,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<OutputInfo>,
    },
}

impl ServerFrame {
    fn from_event(event: JobEvent) -> Self {
        let (seq, ts_ms) = (event.seq, event.ts_ms);
        match event.body {
            EventBody::Status { status, progress, stage, message, plugin } => {
                ServerFrame::Status { seq, ts_ms, status, progress, stage, message, plugin }
            }
            EventBody::Log { line } => ServerFrame::Log { seq, ts_ms, line },
            EventBody::Gap { dropped } => ServerFrame::Log {
                seq,
                ts_ms,
                line: format!("skipped {dropped} events (slow consumer)"),
            },
            EventBody::Terminal { status, error_code, error, output } => {
                ServerFrame::Terminal { seq, ts_ms, status, error_code, error, output }
            }
        }
    }

    /// Terminal frame synthesized from a job snapshot (used when the
    /// retained stream no longer carries the terminal event).
    fn from_job(job: &Job) -> Self {
        ServerFrame::Terminal {
            seq: 0,
            ts_ms: job.completed_at_ms.unwrap_or(job.updated_at_ms),
            status: job.status,
            error_code: job.error_code,
            error: job.error.clone(),
            output: job.output.clone(),
        }
    }
}

/// Frames accepted from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Ping,
    Ack { seq: u64 },
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    pub since_seq: Option<u64>,
}

/// `GET /ws/tasks/{id}` upgrade handler.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SubscribeQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let job_id = JobId::from_string(id);
    let job = state.store.get(&job_id)?;
    let since = query.since_seq.unwrap_or(0);
    Ok(ws.on_upgrade(move |socket| session(state, job, since, socket)))
}

async fn session(state: AppState, job: Job, since: u64, mut socket: WebSocket) {
    let clock = SystemClock;

    // Terminal jobs whose retained stream no longer includes the terminal
    // event (tombstones, retention rollover): synthesize it and finish.
    let retained = state.store.events_since(&job.id, since);
    if job.is_terminal() && !retained.iter().any(|e| e.body.is_terminal()) {
        let _ = send_frame(&mut socket, &ServerFrame::from_job(&job)).await;
        let _ = close(&mut socket, close_code::NORMAL, "complete").await;
        return;
    }

    let Ok(mut sub) = state.bus.subscribe(job.id, since) else {
        let _ = close(&mut socket, close_code::ERROR, "subscription failed").await;
        return;
    };

    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let stale_after = state.heartbeat * 2;
    let mut last_activity = tokio::time::Instant::now();

    loop {
        tokio::select! {
            event = sub.recv() => match event {
                Ok(event) => {
                    let terminal = event.body.is_terminal();
                    if send_frame(&mut socket, &ServerFrame::from_event(event)).await.is_err() {
                        break;
                    }
                    if terminal {
                        let _ = close(&mut socket, close_code::NORMAL, "complete").await;
                        break;
                    }
                }
                Err(Closed::Finished) => {
                    let _ = close(&mut socket, close_code::NORMAL, "complete").await;
                    break;
                }
                Err(Closed::SlowConsumer) => {
                    tracing::warn!(id = %job.id, "disconnecting slow consumer");
                    let _ = close(&mut socket, close_code::POLICY, "slow_consumer").await;
                    break;
                }
            },

            _ = heartbeat.tick() => {
                let frame = ServerFrame::Heartbeat { ts_ms: clock.epoch_ms() };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
                // Protocol-level ping so well-behaved clients refresh the
                // staleness deadline without application logic.
                if socket.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }

            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    last_activity = tokio::time::Instant::now();
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(ClientFrame::Ping) => {
                            let pong = ServerFrame::Pong { ts_ms: clock.epoch_ms() };
                            if send_frame(&mut socket, &pong).await.is_err() {
                                break;
                            }
                        }
                        Ok(ClientFrame::Ack { seq }) => sub.ack(seq),
                        // All other inbound frames are ignored.
                        Err(_) => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => last_activity = tokio::time::Instant::now(),
                Some(Err(e)) => {
                    tracing::debug!(id = %job.id, %e, "socket error");
                    break;
                }
            },

            () = tokio::time::sleep_until(last_activity + stale_after) => {
                tracing::debug!(id = %job.id, "reaping stale connection");
                let _ = close(&mut socket, close_code::POLICY, "stale").await;
                break;
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}

async fn close(socket: &mut WebSocket, code: u16, reason: &str) -> Result<(), axum::Error> {
    socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.to_string().into() })))
        .await
}

#[cfg(test)]
#[path = "ws_tests.rs"]
mod tests;
