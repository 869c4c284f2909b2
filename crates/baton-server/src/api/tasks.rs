use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;

use baton_core::models::task::{CreateTaskInput, Page, Task, TaskStatus};
use baton_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_task))
        .route("/archived", get(list_archived))
        .route("/archived/{id}", delete(delete_archived))
        .route("/{id}", get(get_task))
        .route("/{id}/status", post(update_task_status))
        .route("/{id}/archive", post(archive_task))
        .route("/{id}/unarchive", post(unarchive_task))
        .route("/{id}/activity", get(task_activity))
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskInput>,
) -> Result<(StatusCode, Json<Task>), ServerError> {
    let task = state.task_store.create(body).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServerError> {
    state
        .task_store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound("Task not found".to_string()))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: String,
}

async fn update_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> Result<Json<Task>, ServerError> {
    let status = TaskStatus::from_str(&body.status)
        .ok_or_else(|| ServerError::BadRequest(format!("Invalid status: {}", body.status)))?;
    Ok(Json(state.task_store.update_status(&id, status).await?))
}

async fn task_activity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    if state.task_store.get(&id).await?.is_none() {
        return Err(ServerError::NotFound("Task not found".to_string()));
    }
    let activity = state.task_store.activity(&id).await?;
    Ok(Json(serde_json::json!({ "activity": activity })))
}

// ─── Archive ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ArchivedQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

async fn list_archived(
    State(state): State<AppState>,
    Query(query): Query<ArchivedQuery>,
) -> Result<Json<Page<Task>>, ServerError> {
    Ok(Json(state.archive.list_archived(query.page, query.limit).await?))
}

async fn archive_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServerError> {
    Ok(Json(state.archive.archive_now(&id).await?))
}

async fn unarchive_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ServerError> {
    Ok(Json(state.archive.unarchive(&id).await?))
}

async fn delete_archived(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.archive.delete_archived(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
