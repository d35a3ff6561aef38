// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP admission API.

use crate::dto::{CreatedDto, TaskDto};
use crate::error::ApiError;
use crate::ws;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use replug_bus::EventBus;
use replug_core::{JobId, SystemClock};
use replug_engine::Controller;
use replug_store::JobStore;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared handler context.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller<SystemClock>>,
    pub store: Arc<JobStore>,
    pub bus: EventBus,
    pub heartbeat: Duration,
}

pub fn router(state: AppState, upload_cap: usize) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/marketplace", post(create_marketplace_task))
        .route("/tasks/upload", post(create_upload_task))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/tasks/{id}/download", get(download_output))
        .route("/files", get(list_files))
        .route("/ws/tasks/{id}", get(ws::subscribe))
        // Multipart bodies may carry a whole plugin; the controller
        // enforces the exact cap, this only bounds the transport.
        .layer(axum::extract::DefaultBodyLimit::max(upload_cap.saturating_add(1024 * 1024)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct MarketplaceCoordinate {
    author: String,
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct CreateTaskBody {
    url: Option<String>,
    marketplace_plugin: Option<MarketplaceCoordinate>,
    platform: Option<String>,
    suffix: Option<String>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskBody>,
) -> Result<Json<CreatedDto>, ApiError> {
    let job = match (body.url, body.marketplace_plugin) {
        (Some(url), None) => {
            state.controller.create_url(url, body.platform, body.suffix).await?
        }
        (None, Some(plugin)) => {
            state
                .controller
                .create_marketplace(
                    plugin.author,
                    plugin.name,
                    plugin.version,
                    body.platform,
                    body.suffix,
                )
                .await?
        }
        _ => {
            return Err(ApiError::invalid(
                "exactly one of `url` or `marketplace_plugin` is required",
            ));
        }
    };
    Ok(Json(CreatedDto::from(&job)))
}

#[derive(Debug, Deserialize)]
struct MarketplaceBody {
    author: String,
    name: String,
    version: String,
    platform: Option<String>,
    suffix: Option<String>,
}

async fn create_marketplace_task(
    State(state): State<AppState>,
    Json(body): Json<MarketplaceBody>,
) -> Result<Json<CreatedDto>, ApiError> {
    let job = state
        .controller
        .create_marketplace(body.author, body.name, body.version, body.platform, body.suffix)
        .await?;
    Ok(Json(CreatedDto::from(&job)))
}

async fn create_upload_task(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<CreatedDto>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut platform = None;
    let mut suffix = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .ok_or_else(|| ApiError::invalid("file field has no filename"))?
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::invalid(format!("upload read failed: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            Some("platform") => {
                platform = field.text().await.ok().filter(|s| !s.is_empty());
            }
            Some("suffix") => {
                suffix = field.text().await.ok().filter(|s| !s.is_empty());
            }
            _ => {}
        }
    }

    let (filename, bytes) =
        file.ok_or_else(|| ApiError::invalid("multipart field `file` is required"))?;
    let job = state.controller.create_upload(filename, bytes, platform, suffix).await?;
    Ok(Json(CreatedDto::from(&job)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDto>, ApiError> {
    let job = state.controller.get(&JobId::from_string(id))?;
    Ok(Json(TaskDto::from(&job)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<TaskDto>> {
    Json(state.controller.list_recent(query.limit).iter().map(TaskDto::from).collect())
}

async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<TaskDto>> {
    Json(state.controller.list_completed(query.limit).iter().map(TaskDto::from).collect())
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDto>, ApiError> {
    let id = JobId::from_string(id);
    state.controller.cancel(&id)?;
    let job = state.controller.get(&id)?;
    Ok(Json(TaskDto::from(&job)))
}

async fn download_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = JobId::from_string(id);
    let (job, file) = state.controller.open_output(&id).await?;
    let output = job
        .output
        .ok_or_else(|| ApiError::new(replug_core::ErrorCode::NotFound, "output missing"))?;

    let stream = tokio_util::io::ReaderStream::new(file);
    let body = axum::body::Body::from_stream(stream);
    let response = (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", output.filename),
            ),
            (header::CONTENT_LENGTH, output.size.to_string()),
        ],
        body,
    );
    Ok(response.into_response())
}
