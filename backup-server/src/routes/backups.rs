use crate::error::AppError;
use crate::models::{backup, server};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use backup_engine::models::{ArchiveFormat, BackupDefinition, ProgressView, RunState};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/processes", delete(purge_processes))
        .route("/processes/running", get(running_processes))
        .route("/processes/{id}", delete(purge_process))
        .route("/{id}", get(get_backup))
        .route("/{id}/execute", post(execute_backup))
        .route("/{id}/progress", get(get_progress))
}

async fn list_backups(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupDefinition>>, AppError> {
    let db = state.db.clone();
    let backups = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_all(&conn)
    })
    .await??;
    Ok(Json(backups))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupDefinition>, AppError> {
    let db = state.db.clone();
    let found = tokio::task::spawn_blocking(move || {
        let conn = db.get()?;
        backup::find_by_id(&conn, &id)
    })
    .await??;
    match found {
        Some(b) => Ok(Json(b)),
        None => Err(AppError::NotFound("Backup not found".into())),
    }
}

async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<backup::CreateBackupRequest>,
) -> Result<(StatusCode, Json<BackupDefinition>), AppError> {
    if body.name.trim().is_empty() {
        return Err(AppError::BadRequest("name is required".into()));
    }
    if body.source.trim().is_empty() {
        return Err(AppError::BadRequest("source is required".into()));
    }
    if body.destination.trim().is_empty() {
        return Err(AppError::BadRequest("destination is required".into()));
    }
    body.file_type.parse::<ArchiveFormat>()?;

    let db = state.db.clone();
    let created = tokio::task::spawn_blocking(move || -> Result<BackupDefinition, AppError> {
        let conn = db.get().map_err(anyhow::Error::from)?;
        for id in &body.server_ids {
            if !server::exists(&conn, id)? {
                return Err(AppError::BadRequest(format!("Target server {} not found", id)));
            }
        }
        Ok(backup::create(&conn, &body)?)
    })
    .await??;

    tracing::info!(definition_id = %created.id, name = %created.name, "Backup created");
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Debug, Deserialize)]
struct ExecuteParams {
    executed_by: Option<String>,
}

async fn execute_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ExecuteParams>,
) -> Result<Json<Value>, AppError> {
    let started = state.orchestrator.execute_async(&id, params.executed_by).await?;
    Ok(Json(json!({
        "message": "Backup execution started",
        "run_id": started.run_id,
        "backup_id": started.definition_id,
        "started_at": started.started_at,
    })))
}

async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RunState>, AppError> {
    Ok(Json(state.orchestrator.latest_progress(&id).await?))
}

async fn running_processes(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ProgressView>>, AppError> {
    Ok(Json(state.orchestrator.active_or_recent_views().await?))
}

/// Runs still executing in this process are never purged.
async fn executing_run_ids(state: &AppState) -> Result<Vec<String>, AppError> {
    let mut keep = Vec::new();
    for run in state.orchestrator.active_or_recent().await? {
        if state.orchestrator.is_executing(&run.definition_id).await {
            keep.push(run.id);
        }
    }
    Ok(keep)
}

async fn purge_processes(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let keep = executing_run_ids(&state).await?;
    let store = state.store.clone();
    let removed = tokio::task::spawn_blocking(move || store.purge_processes(&keep)).await??;
    tracing::info!(removed, "Purged backup processes");
    Ok(Json(json!({ "message": "Processes deleted", "deleted": removed })))
}

async fn purge_process(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if executing_run_ids(&state).await?.contains(&id) {
        return Err(AppError::Conflict(format!("Process {} is still running", id)));
    }
    let store = state.store.clone();
    let run_id = id.clone();
    let removed = tokio::task::spawn_blocking(move || store.purge_process(&run_id)).await??;
    if !removed {
        return Err(AppError::NotFound(format!("Process {} not found", id)));
    }
    Ok(Json(json!({ "message": "Process deleted" })))
}
