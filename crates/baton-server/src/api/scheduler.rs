//! Manual triggers for the background sweeps.

use axum::{extract::State, routing::post, Json, Router};

use baton_core::{AppState, ServerError, SweepReport};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sweep", post(run_sweep))
        .route("/archive", post(run_archive))
}

async fn run_sweep(State(state): State<AppState>) -> Result<Json<SweepReport>, ServerError> {
    Ok(Json(state.sweeper.run_all_scheduled().await?))
}

async fn run_archive(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let archived = state.archive.archive_completed().await?;
    Ok(Json(serde_json::json!({ "archived": archived })))
}
