pub mod runs;
pub mod scheduler;
pub mod tasks;
pub mod workflows;

use axum::Router;

use baton_core::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/workflows", workflows::router())
        .nest("/api/runs", runs::router())
        .nest("/api/tasks", tasks::router())
        .nest("/api/scheduler", scheduler::router())
}
