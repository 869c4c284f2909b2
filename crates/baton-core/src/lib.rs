//! Baton Core: transport-agnostic domain logic for the Baton workflow engine.
//!
//! A workflow is an ordered list of steps, each bound to an agent. A run is
//! one execution of a workflow for a task. Agents poll for work, claim a
//! step (or one story of a loop step), and report completion or failure;
//! the engine advances the pipeline, and background sweepers recover
//! abandoned work and archive finished tasks.
//!
//! This crate has **no HTTP framework dependency** by default, so it can back
//! the `baton-server` HTTP API and the `baton` CLI alike.
//!
//! # Feature Flags
//!
//! - `axum`: enables `IntoResponse` impl on `ServerError` for use in axum handlers.

pub mod db;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use db::Database;
pub use error::ServerError;
pub use scheduler::{
    ArchiveConfig, ArchiveSweeper, BackgroundSweepers, SweepReport, Sweeper, SweeperConfig,
};
pub use state::{AppState, AppStateInner, CoreConfig};
pub use workflow::{EngineConfig, WorkflowEngine};
