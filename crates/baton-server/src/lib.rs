//! Baton Server - HTTP front end for the Baton workflow engine
//!
//! A thin axum adapter over `baton-core`, providing:
//! - RESTful HTTP API for workflows, runs, steps, stories and task archival
//! - SQLite persistence via `baton_core::Database`
//! - Background scheduler and archive sweepers
//!
//! This crate can be used standalone (`baton server`) or embedded in tests.

pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use baton_core::{AppState, AppStateInner, BackgroundSweepers, CoreConfig, Database};

/// Configuration for the Baton server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    /// Engine and sweeper tunables.
    pub core: CoreConfig,
    /// Start the scheduler and archive sweepers alongside the HTTP listener.
    pub run_sweepers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3210,
            db_path: "baton.db".to_string(),
            core: CoreConfig::default(),
            run_sweepers: true,
        }
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub state: AppState,
    sweepers: Option<BackgroundSweepers>,
}

impl ServerHandle {
    /// Stop the background sweepers. The HTTP task lives until the runtime exits.
    pub async fn shutdown(self) {
        if let Some(sweepers) = self.sweepers {
            sweepers.shutdown().await;
        }
    }
}

/// Create a shared `AppState` from a database path.
pub fn create_app_state(db_path: &str, config: CoreConfig) -> Result<AppState, String> {
    let db = Database::open(db_path).map_err(|e| format!("Failed to open database: {}", e))?;
    Ok(Arc::new(AppStateInner::with_config(db, config)))
}

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "baton_server=info,baton_core=info,tower_http=info".into()
            }),
        )
        .try_init();
}

/// Start the Baton server.
///
/// Returns once the listener is bound; serving continues on a background task.
pub async fn start_server(config: ServerConfig) -> Result<ServerHandle, String> {
    init_tracing();

    tracing::info!(
        "Starting Baton server on {}:{}",
        config.host,
        config.port
    );

    let state = create_app_state(&config.db_path, config.core.clone())?;

    start_server_with_state(config, state).await
}

/// Start the HTTP server with a pre-built `AppState`.
pub async fn start_server_with_state(
    config: ServerConfig,
    state: AppState,
) -> Result<ServerHandle, String> {
    let app = build_router(state.clone());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("Failed to get local address: {}", e))?;

    tracing::info!("Baton server listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Server error: {}", e);
        }
    });

    let sweepers = config
        .run_sweepers
        .then(|| BackgroundSweepers::start(state.sweeper.clone(), state.archive.clone()));

    Ok(ServerHandle {
        addr: local_addr,
        state,
        sweepers,
    })
}

/// The full router with CORS and request tracing.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "baton-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
