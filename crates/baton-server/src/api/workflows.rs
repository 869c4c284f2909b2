use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};

use baton_core::models::workflow::{CreateWorkflowInput, Workflow};
use baton_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route("/{id}", get(get_workflow).delete(delete_workflow))
}

async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let workflows = state.workflow_store.list().await?;
    Ok(Json(serde_json::json!({ "workflows": workflows })))
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(body): Json<CreateWorkflowInput>,
) -> Result<(StatusCode, Json<Workflow>), ServerError> {
    let workflow = state.workflow_store.create(body).await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ServerError> {
    state
        .workflow_store
        .get(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ServerError::NotFound("Workflow not found".to_string()))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    state.workflow_store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}
