//! Runs, steps and stories.
//!
//! Agents poll `POST /api/runs/claim` (or claim a named step), then report
//! back through `complete` / `fail`. Everything else is read access and
//! manual overrides.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;

use baton_core::models::run::{CreateRunInput, Run, RunFilter, RunStatus};
use baton_core::models::step::{Step, UnitOutput, UpdateStepInput};
use baton_core::models::story::{Story, StorySeed, UpdateStoryInput};
use baton_core::workflow::{ClaimedStep, ClaimedStory, CompletionOutcome, FailureOutcome};
use baton_core::{AppState, ServerError};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs).post(create_run))
        .route("/claim", post(claim_next))
        .route("/{id}", get(get_run))
        .route("/{id}/status", patch(update_run_status))
        // ─── Steps ─────────────────────────────────────────────────────
        .route("/{id}/steps", get(list_steps))
        .route("/{id}/steps/pending", get(pending_steps))
        .route("/{id}/steps/{step_id}", get(get_step).patch(update_step))
        .route("/{id}/steps/{step_id}/claim", post(claim_step))
        .route("/{id}/steps/{step_id}/complete", post(complete_step))
        .route("/{id}/steps/{step_id}/fail", post(fail_step))
        .route(
            "/{id}/steps/{step_id}/stories",
            get(list_step_stories).post(add_stories),
        )
        .route("/{id}/steps/{step_id}/stories/claim", post(claim_story))
        // ─── Stories ───────────────────────────────────────────────────
        .route("/{id}/stories", get(list_run_stories))
        .route("/{id}/stories/{story_id}", get(get_story).patch(update_story))
        .route("/{id}/stories/{story_id}/start", post(start_story))
        .route("/{id}/stories/{story_id}/complete", post(complete_story))
        .route("/{id}/stories/{story_id}/fail", post(fail_story))
}

// ─── Request bodies ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRunsQuery {
    status: Option<String>,
    task_id: Option<String>,
    workflow_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateRunStatusRequest {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollRequest {
    agent_id: String,
    run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest {
    agent_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoryClaimRequest {
    claimed_by: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CompleteRequest {
    output: Option<UnitOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct FailRequest {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddStoriesRequest {
    stories: Vec<StorySeed>,
}

fn output_of(body: CompleteRequest) -> UnitOutput {
    body.output.unwrap_or_else(|| UnitOutput::Text(String::new()))
}

fn parse_run_status(value: &str) -> Result<RunStatus, ServerError> {
    RunStatus::from_str(value)
        .ok_or_else(|| ServerError::BadRequest(format!("Invalid status: {}", value)))
}

// ─── Runs ──────────────────────────────────────────────────────────────

async fn create_run(
    State(state): State<AppState>,
    Json(body): Json<CreateRunInput>,
) -> Result<(StatusCode, Json<Run>), ServerError> {
    let run = state.engine.create_run(body).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let status = query.status.as_deref().map(parse_run_status).transpose()?;
    let runs = state
        .engine
        .list_runs(RunFilter {
            status,
            task_id: query.task_id,
            workflow_id: query.workflow_id,
        })
        .await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, ServerError> {
    Ok(Json(state.engine.get_run(&id).await?))
}

async fn update_run_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateRunStatusRequest>,
) -> Result<Json<Run>, ServerError> {
    let status = parse_run_status(&body.status)?;
    Ok(Json(state.engine.update_run_status(&id, status).await?))
}

/// Polling claim. An empty queue is a normal answer, not an error.
async fn claim_next(
    State(state): State<AppState>,
    Json(body): Json<PollRequest>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let claimed = state
        .engine
        .claim_next_step(&body.agent_id, body.run_id.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "claimed": claimed })))
}

// ─── Steps ─────────────────────────────────────────────────────────────

async fn list_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let steps = state.engine.list_steps(&id).await?;
    Ok(Json(serde_json::json!({ "steps": steps })))
}

async fn pending_steps(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let steps = state.engine.pending_steps(&id).await?;
    Ok(Json(serde_json::json!({ "steps": steps })))
}

async fn get_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
) -> Result<Json<Step>, ServerError> {
    Ok(Json(state.engine.get_step(&id, &step_id).await?))
}

async fn claim_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    body: Option<Json<ClaimRequest>>,
) -> Result<Json<ClaimedStep>, ServerError> {
    let agent_id = body
        .and_then(|Json(b)| b.agent_id)
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| ServerError::BadRequest("agentId is required".to_string()))?;
    Ok(Json(state.engine.claim_step(&id, &step_id, &agent_id).await?))
}

async fn complete_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<CompletionOutcome>, ServerError> {
    let outcome = state
        .engine
        .complete_step(&id, &step_id, output_of(body))
        .await?;
    Ok(Json(outcome))
}

async fn fail_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    body: Option<Json<FailRequest>>,
) -> Result<Json<FailureOutcome>, ServerError> {
    let error = body.and_then(|Json(b)| b.error).unwrap_or_default();
    Ok(Json(state.engine.fail_step(&id, &step_id, &error).await?))
}

async fn update_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    Json(body): Json<UpdateStepInput>,
) -> Result<Json<Step>, ServerError> {
    Ok(Json(state.engine.update_step(&id, &step_id, body).await?))
}

async fn list_step_stories(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let stories = state.engine.list_step_stories(&id, &step_id).await?;
    Ok(Json(serde_json::json!({ "stories": stories })))
}

async fn add_stories(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    Json(body): Json<AddStoriesRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServerError> {
    let stories = state.engine.add_stories(&id, &step_id, body.stories).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "stories": stories })),
    ))
}

async fn claim_story(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    body: Option<Json<StoryClaimRequest>>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let claimed_by = body.and_then(|Json(b)| b.claimed_by);
    let claimed = state
        .engine
        .claim_story(&id, &step_id, claimed_by.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "claimed": claimed })))
}

// ─── Stories ───────────────────────────────────────────────────────────

async fn list_run_stories(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let stories = state.engine.list_run_stories(&id).await?;
    Ok(Json(serde_json::json!({ "stories": stories })))
}

async fn get_story(
    State(state): State<AppState>,
    Path((id, story_id)): Path<(String, String)>,
) -> Result<Json<Story>, ServerError> {
    Ok(Json(state.engine.get_story(&id, &story_id).await?))
}

async fn start_story(
    State(state): State<AppState>,
    Path((id, story_id)): Path<(String, String)>,
    body: Option<Json<StoryClaimRequest>>,
) -> Result<Json<ClaimedStory>, ServerError> {
    let claimed_by = body.and_then(|Json(b)| b.claimed_by);
    let claimed = state
        .engine
        .start_story(&id, &story_id, claimed_by.as_deref())
        .await?;
    Ok(Json(claimed))
}

async fn complete_story(
    State(state): State<AppState>,
    Path((id, story_id)): Path<(String, String)>,
    Json(body): Json<CompleteRequest>,
) -> Result<Json<CompletionOutcome>, ServerError> {
    let outcome = state
        .engine
        .complete_story(&id, &story_id, output_of(body))
        .await?;
    Ok(Json(outcome))
}

async fn fail_story(
    State(state): State<AppState>,
    Path((id, story_id)): Path<(String, String)>,
    body: Option<Json<FailRequest>>,
) -> Result<Json<FailureOutcome>, ServerError> {
    let error = body.and_then(|Json(b)| b.error).unwrap_or_default();
    Ok(Json(state.engine.fail_story(&id, &story_id, &error).await?))
}

async fn update_story(
    State(state): State<AppState>,
    Path((id, story_id)): Path<(String, String)>,
    Json(body): Json<UpdateStoryInput>,
) -> Result<Json<Story>, ServerError> {
    Ok(Json(state.engine.update_story(&id, &story_id, body).await?))
}
