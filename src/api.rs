//! Thin REST surface over the engine (spec.md §1: "a thin HTTP wrapper is in
//! scope; a full product API is not"). Kept deliberately minimal and not a
//! focus of testing — it exists to drive [`pipeline::ingest`], the query
//! planners, and [`backup`] from the teacher's own `axum` router shape.

use std::path::PathBuf;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::spawn;
use tracing::{error, info};

use crate::app_state::{AppState, Status};
use crate::{backup, pipeline, query};

#[derive(Deserialize)]
pub struct IngestPayload {
    pub documents: Vec<String>,
}

#[derive(Deserialize)]
pub struct QueryPayload {
    pub question: String,
    #[serde(default)]
    pub mode: QueryMode,
}

#[derive(Deserialize, Default, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    #[default]
    Local,
    Global,
    Naive,
}

#[derive(Serialize)]
pub struct QueryResponse {
    answer: String,
}

#[derive(Deserialize)]
pub struct BackupPayload {
    pub backup_id: String,
    pub output_dir: String,
}

#[derive(Deserialize)]
pub struct RestorePayload {
    pub archive_path: String,
}

pub fn create_router(app_state: AppState) -> Router {
    Router::new()
        .route("/api/ingest", post(ingest_handler))
        .route("/api/query", post(query_handler))
        .route("/api/status", get(status_handler))
        .route("/api/backup", post(backup_handler))
        .route("/api/restore", post(restore_handler))
        .route("/api/shutdown", post(shutdown_handler))
        .with_state(app_state)
}

async fn ingest_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    {
        let mut status = state.status.lock().unwrap();
        if status.is_busy {
            return Err((StatusCode::CONFLICT, Json(json!({"error": "an ingest is already running"}))));
        }
        status.is_busy = true;
        status.message = "ingest starting".to_string();
        status.progress = 0.0;
    }

    spawn(async move {
        let result = pipeline::ingest(&state.storage, state.gateway.as_ref(), state.tokenizer.as_ref(), &state.config, payload.documents).await;

        let mut status = state.status.lock().unwrap();
        status.is_busy = false;
        status.progress = 1.0;
        match result {
            Ok(summary) => status.message = format!("ingest complete: {summary}"),
            Err(err) => {
                error!(error = %err, "ingest failed");
                status.message = format!("ingest failed: {}", err.message);
            }
        }
    });

    Ok(StatusCode::ACCEPTED)
}

async fn query_handler(
    State(state): State<AppState>,
    Json(payload): Json<QueryPayload>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<serde_json::Value>)> {
    let result = match payload.mode {
        QueryMode::Local => {
            query::local_query(
                state.storage.graph.as_ref(),
                state.storage.entity_vectors.as_ref(),
                state.storage.text_chunks.as_ref(),
                state.gateway.as_ref(),
                &state.config.query,
                &payload.question,
            )
            .await
        }
        QueryMode::Global => {
            query::global_query(
                state.storage.community_reports.as_ref(),
                state.gateway.as_ref(),
                &state.config.query,
                &payload.question,
            )
            .await
        }
        QueryMode::Naive => {
            query::naive_query(
                state.storage.chunk_vectors.as_ref(),
                state.storage.text_chunks.as_ref(),
                state.gateway.as_ref(),
                &state.config.query,
                &payload.question,
            )
            .await
        }
    };

    match result {
        Ok(answer) => Ok(Json(QueryResponse { answer })),
        Err(err) => {
            error!(error = %err, "query failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.message}))))
        }
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<Status> {
    Json(state.status.lock().unwrap().clone())
}

async fn backup_handler(
    State(state): State<AppState>,
    Json(payload): Json<BackupPayload>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    backup::create_backup(&state.storage, &state.config, &payload.backup_id, &PathBuf::from(payload.output_dir))
        .await
        .map(|path| Json(json!({ "archive_path": path.to_string_lossy() })))
        .map_err(|err| {
            error!(error = %err, "backup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.message})))
        })
}

async fn restore_handler(
    State(state): State<AppState>,
    Json(payload): Json<RestorePayload>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    backup::restore_backup(&state.storage, &PathBuf::from(payload.archive_path))
        .await
        .map(|_| StatusCode::OK)
        .map_err(|err| {
            error!(error = %err, "restore failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.message})))
        })
}

async fn shutdown_handler(State(state): State<AppState>) -> impl IntoResponse {
    info!("shutdown requested");
    if let Some(sender) = state.shutdown_sender.lock().unwrap().take() {
        let _ = sender.send(());
    }
    StatusCode::OK
}
