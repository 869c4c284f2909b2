//! SQLite database layer for the Baton engine.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime. Multi-row state transitions go
//! through [`Database::transaction`], which opens an IMMEDIATE transaction
//! so the write lock is taken up front.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ServerError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, ServerError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ServerError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ServerError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| ServerError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ServerError::Database(format!("Task join error: {}", e)))?
    }

    /// Run a closure inside a single IMMEDIATE transaction.
    ///
    /// The transaction commits only if the closure returns `Ok`; any error
    /// (domain or database) rolls every write back.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, ServerError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| ServerError::Database(format!("Lock poisoned: {}", e)))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Async wrapper around [`Database::with_transaction`].
    pub async fn transaction<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_transaction(f))
            .await
            .map_err(|e| ServerError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), ServerError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    description     TEXT,
                    steps           TEXT NOT NULL DEFAULT '[]',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runs (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id),
                    task_id         TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    context         TEXT NOT NULL DEFAULT '{}',
                    created_at      INTEGER NOT NULL,
                    started_at      INTEGER,
                    completed_at    INTEGER,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
                CREATE INDEX IF NOT EXISTS idx_runs_task ON runs(task_id);
                CREATE INDEX IF NOT EXISTS idx_runs_workflow ON runs(workflow_id);

                CREATE TABLE IF NOT EXISTS steps (
                    id                  TEXT PRIMARY KEY,
                    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    step_index          INTEGER NOT NULL,
                    step_id             TEXT NOT NULL,
                    agent_id            TEXT NOT NULL,
                    input_template      TEXT NOT NULL DEFAULT '',
                    expects             TEXT NOT NULL DEFAULT '',
                    kind                TEXT NOT NULL DEFAULT 'single',
                    kind_config         TEXT NOT NULL DEFAULT '{\"type\":\"single\"}',
                    status              TEXT NOT NULL DEFAULT 'waiting',
                    output              TEXT,
                    error               TEXT,
                    retry_count         INTEGER NOT NULL DEFAULT 0,
                    max_retries         INTEGER NOT NULL DEFAULT 2,
                    current_story_id    TEXT,
                    claimed_by          TEXT,
                    claimed_at          INTEGER,
                    previous_status     TEXT,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    UNIQUE (run_id, step_index)
                );
                CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
                CREATE INDEX IF NOT EXISTS idx_steps_status ON steps(status);
                CREATE INDEX IF NOT EXISTS idx_steps_agent ON steps(agent_id, status);

                CREATE TABLE IF NOT EXISTS stories (
                    id                  TEXT PRIMARY KEY,
                    step_id             TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
                    run_id              TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    story_index         INTEGER NOT NULL,
                    story_id            TEXT NOT NULL,
                    title               TEXT NOT NULL,
                    description         TEXT NOT NULL DEFAULT '',
                    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                    status              TEXT NOT NULL DEFAULT 'pending',
                    output              TEXT,
                    error               TEXT,
                    retry_count         INTEGER NOT NULL DEFAULT 0,
                    max_retries         INTEGER NOT NULL DEFAULT 2,
                    claimed_by          TEXT,
                    claimed_at          INTEGER,
                    created_at          INTEGER NOT NULL,
                    updated_at          INTEGER NOT NULL,
                    UNIQUE (step_id, story_index)
                );
                CREATE INDEX IF NOT EXISTS idx_stories_step ON stories(step_id);
                CREATE INDEX IF NOT EXISTS idx_stories_status ON stories(status);

                CREATE TABLE IF NOT EXISTS tasks (
                    id              TEXT PRIMARY KEY,
                    title           TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'todo',
                    completed_at    INTEGER,
                    archived_at     INTEGER,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

                CREATE TABLE IF NOT EXISTS task_activities (
                    id              TEXT PRIMARY KEY,
                    task_id         TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    action          TEXT NOT NULL,
                    field           TEXT NOT NULL,
                    old_value       TEXT,
                    new_value       TEXT,
                    source          TEXT NOT NULL,
                    created_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_task_activities_task ON task_activities(task_id);
                ",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<(), ServerError> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO tasks (id, title, status, created_at, updated_at)
                     VALUES ('t1', 'Task', 'todo', 0, 0)",
                    [],
                )?;
                Err(ServerError::BadRequest("abort".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .with_conn_async(|conn| conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn file_backed_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("baton.db");
        let path = path.to_string_lossy().to_string();

        {
            let db = Database::open(&path).unwrap();
            db.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO tasks (id, title, status, created_at, updated_at)
                     VALUES ('t1', 'Task', 'todo', 0, 0)",
                    [],
                )
            })
            .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let title: String = db
            .with_conn(|conn| conn.query_row("SELECT title FROM tasks WHERE id = 't1'", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(title, "Task");
    }
}
