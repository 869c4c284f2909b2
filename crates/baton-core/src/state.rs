//! Shared application state for the HTTP layer and the CLI.

use std::sync::Arc;

use crate::db::Database;
use crate::scheduler::{ArchiveConfig, ArchiveSweeper, Sweeper, SweeperConfig};
use crate::store::{TaskStore, WorkflowStore};
use crate::workflow::{EngineConfig, WorkflowEngine};

/// Tunables for every component built on top of the database.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub engine: EngineConfig,
    pub sweeper: SweeperConfig,
    pub archive: ArchiveConfig,
}

/// Shared state accessible by all API handlers.
pub struct AppStateInner {
    pub db: Database,
    pub workflow_store: WorkflowStore,
    pub task_store: TaskStore,
    pub engine: WorkflowEngine,
    pub sweeper: Sweeper,
    pub archive: ArchiveSweeper,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(db: Database) -> Self {
        Self::with_config(db, CoreConfig::default())
    }

    pub fn with_config(db: Database, config: CoreConfig) -> Self {
        Self {
            workflow_store: WorkflowStore::new(db.clone()),
            task_store: TaskStore::new(db.clone()),
            engine: WorkflowEngine::new(db.clone(), config.engine),
            sweeper: Sweeper::new(db.clone(), config.sweeper),
            archive: ArchiveSweeper::new(db.clone(), config.archive),
            db,
        }
    }
}
