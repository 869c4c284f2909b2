//! Archival of completed task records, on a timer or on request.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::ServerError;
use crate::models::task::{ActivitySource, Page, Task, TaskStatus};
use crate::store::task_store::{list_tasks_where, load_task, record_activity};

const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub interval: Duration,
    /// Completed tasks older than this are archived.
    pub delay: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            delay: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone)]
pub struct ArchiveSweeper {
    db: Database,
    config: ArchiveConfig,
}

impl ArchiveSweeper {
    pub fn new(db: Database, config: ArchiveConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Archive every completed task whose `completed_at` is at least `delay`
    /// before `now`. Returns how many were archived.
    pub async fn archive_completed_at(&self, now: DateTime<Utc>) -> Result<usize, ServerError> {
        let cutoff = now.timestamp_millis() - self.config.delay.as_millis() as i64;
        let count = self
            .db
            .transaction(move |tx| {
                let due = list_tasks_where(
                    tx,
                    "status = 'completed' AND completed_at IS NOT NULL AND completed_at <= ?1",
                    rusqlite::params![cutoff],
                )?;
                for task in &due {
                    mark_archived(tx, task, ActivitySource::Scheduler, now)?;
                }
                Ok(due.len())
            })
            .await?;
        if count > 0 {
            tracing::info!("Archived {} completed task(s)", count);
        } else {
            tracing::debug!("Archive sweep: nothing to do");
        }
        Ok(count)
    }

    pub async fn archive_completed(&self) -> Result<usize, ServerError> {
        self.archive_completed_at(Utc::now()).await
    }

    /// Archive one task now. It must be `completed`.
    pub async fn archive_now(&self, task_id: &str) -> Result<Task, ServerError> {
        let task_id = task_id.to_string();
        self.db
            .transaction(move |tx| {
                let task = require_task(tx, &task_id)?;
                match task.status {
                    TaskStatus::Archived => {
                        return Err(ServerError::Conflict("Task is already archived".to_string()));
                    }
                    TaskStatus::Completed => {}
                    other => {
                        return Err(ServerError::invalid_state(
                            "Only completed tasks can be archived",
                            other.as_str(),
                        ));
                    }
                }
                mark_archived(tx, &task, ActivitySource::Manual, Utc::now())?;
                require_task(tx, &task_id)
            })
            .await
    }

    /// Return an archived task to `completed`. Its completion time restarts so
    /// the sweeper does not archive it again straight away.
    pub async fn unarchive(&self, task_id: &str) -> Result<Task, ServerError> {
        let task_id = task_id.to_string();
        self.db
            .transaction(move |tx| {
                let task = require_task(tx, &task_id)?;
                if task.status != TaskStatus::Archived {
                    return Err(ServerError::invalid_state(
                        "Task is not archived",
                        task.status.as_str(),
                    ));
                }
                let now = Utc::now();
                tx.execute(
                    "UPDATE tasks SET status = 'completed', archived_at = NULL, completed_at = ?1,
                       updated_at = ?1
                     WHERE id = ?2",
                    rusqlite::params![now.timestamp_millis(), task_id],
                )?;
                record_activity(
                    tx,
                    &task_id,
                    "unarchived",
                    "status",
                    Some(TaskStatus::Archived.as_str()),
                    Some(TaskStatus::Completed.as_str()),
                    ActivitySource::Manual,
                    now,
                )?;
                require_task(tx, &task_id)
            })
            .await
    }

    /// Archived tasks, most recently archived first. `page` starts at 1.
    pub async fn list_archived(
        &self,
        page: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Page<Task>, ServerError> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1) as i64 * limit as i64;
        self.db
            .with_conn_async(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM tasks WHERE status = 'archived'",
                    [],
                    |row| row.get(0),
                )?;
                let items = list_tasks_where(
                    conn,
                    "status = 'archived' ORDER BY archived_at DESC, id LIMIT ?1 OFFSET ?2",
                    rusqlite::params![limit, offset],
                )?;
                Ok(Page {
                    items,
                    total: total as u64,
                    page,
                    limit,
                })
            })
            .await
    }

    /// Permanently delete an archived task and its activity log.
    pub async fn delete_archived(&self, task_id: &str) -> Result<(), ServerError> {
        let task_id = task_id.to_string();
        self.db
            .transaction(move |tx| {
                let task = require_task(tx, &task_id)?;
                if task.status != TaskStatus::Archived {
                    return Err(ServerError::invalid_state(
                        "Only archived tasks can be deleted",
                        task.status.as_str(),
                    ));
                }
                tx.execute("DELETE FROM tasks WHERE id = ?1", rusqlite::params![task_id])?;
                tracing::info!("Deleted archived task {}", task_id);
                Ok(())
            })
            .await
    }
}

fn require_task(conn: &rusqlite::Connection, task_id: &str) -> Result<Task, ServerError> {
    load_task(conn, task_id)?.ok_or_else(|| ServerError::NotFound("Task not found".to_string()))
}

fn mark_archived(
    conn: &rusqlite::Connection,
    task: &Task,
    source: ActivitySource,
    now: DateTime<Utc>,
) -> Result<(), ServerError> {
    conn.execute(
        "UPDATE tasks SET status = 'archived', archived_at = ?1, updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now.timestamp_millis(), task.id],
    )?;
    record_activity(
        conn,
        &task.id,
        "archived",
        "status",
        Some(task.status.as_str()),
        Some(TaskStatus::Archived.as_str()),
        source,
        now,
    )?;
    Ok(())
}
