use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::{ms_to_dt, opt_ms_to_dt, status_column};
use crate::db::Database;
use crate::error::ServerError;
use crate::models::task::{ActivitySource, CreateTaskInput, Task, TaskActivity, TaskStatus};

const TASK_COLUMNS: &str = "id, title, status, completed_at, archived_at, created_at, updated_at";

/// Minimal task record store. Task CRUD belongs to the surrounding product;
/// this only tracks what runs and the archive sweeper need.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateTaskInput) -> Result<Task, ServerError> {
        if input.title.trim().is_empty() {
            return Err(ServerError::BadRequest("title is required".to_string()));
        }
        let task = Task::new(
            input.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            input.title,
        );
        let tc = task.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, title, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        tc.id,
                        tc.title,
                        tc.status.as_str(),
                        tc.created_at.timestamp_millis(),
                        tc.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| match e {
                ServerError::Database(msg) if msg.contains("UNIQUE") => {
                    ServerError::Conflict(format!("Task {} already exists", task.id))
                }
                other => other,
            })?;
        Ok(task)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>, ServerError> {
        let id = id.to_string();
        self.db.with_conn_async(move |conn| load_task(conn, &id)).await
    }

    /// Move a task between working states. `completed` stamps `completed_at`;
    /// archival goes through the archive sweeper instead.
    pub async fn update_status(&self, id: &str, status: TaskStatus) -> Result<Task, ServerError> {
        if status == TaskStatus::Archived {
            return Err(ServerError::BadRequest(
                "Use the archive endpoint to archive a task".to_string(),
            ));
        }
        let id = id.to_string();
        self.db
            .transaction(move |tx| {
                let task = load_task(tx, &id)?
                    .ok_or_else(|| ServerError::NotFound("Task not found".to_string()))?;
                if task.status == TaskStatus::Archived {
                    return Err(ServerError::invalid_state(
                        "Archived tasks must be unarchived first",
                        task.status.as_str(),
                    ));
                }
                let now = Utc::now();
                let completed_at = match status {
                    TaskStatus::Completed => Some(now.timestamp_millis()),
                    _ => None,
                };
                tx.execute(
                    "UPDATE tasks SET status = ?1, completed_at = ?2, updated_at = ?3 WHERE id = ?4",
                    rusqlite::params![status.as_str(), completed_at, now.timestamp_millis(), id],
                )?;
                if task.status != status {
                    record_activity(
                        tx,
                        &id,
                        "status_changed",
                        "status",
                        Some(task.status.as_str()),
                        Some(status.as_str()),
                        ActivitySource::Manual,
                        now,
                    )?;
                }
                load_task(tx, &id)?
                    .ok_or_else(|| ServerError::NotFound("Task not found".to_string()))
            })
            .await
    }

    pub async fn activity(&self, task_id: &str) -> Result<Vec<TaskActivity>, ServerError> {
        let task_id = task_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, action, field, old_value, new_value, source, created_at
                     FROM task_activities WHERE task_id = ?1 ORDER BY created_at, rowid",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![task_id], |row| {
                        Ok(TaskActivity {
                            id: row.get(0)?,
                            task_id: row.get(1)?,
                            action: row.get(2)?,
                            field: row.get(3)?,
                            old_value: row.get(4)?,
                            new_value: row.get(5)?,
                            source: ActivitySource::from_str(&row.get::<_, String>(6)?),
                            created_at: ms_to_dt(row.get(7)?),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

pub(crate) fn load_task(conn: &Connection, id: &str) -> rusqlite::Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
        rusqlite::params![id],
        row_to_task,
    )
    .optional()
}

pub(crate) fn list_tasks_where(
    conn: &Connection,
    clause: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM tasks WHERE {}", TASK_COLUMNS, clause))?;
    let rows = stmt
        .query_map(params, row_to_task)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn record_activity(
    conn: &Connection,
    task_id: &str,
    action: &str,
    field: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    source: ActivitySource,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO task_activities (id, task_id, action, field, old_value, new_value, source, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            task_id,
            action,
            field,
            old_value,
            new_value,
            source.as_str(),
            now.timestamp_millis(),
        ],
    )?;
    Ok(())
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        status: status_column(row, 2, TaskStatus::from_str)?,
        completed_at: opt_ms_to_dt(row.get(3)?),
        archived_at: opt_ms_to_dt(row.get(4)?),
        created_at: ms_to_dt(row.get(5)?),
        updated_at: ms_to_dt(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completing_a_task_stamps_completed_at_and_logs_activity() {
        let store = TaskStore::new(Database::open_in_memory().unwrap());
        let task = store
            .create(CreateTaskInput {
                id: Some("42".to_string()),
                title: "Ship login".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Todo);

        let done = store.update_status("42", TaskStatus::Completed).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());

        let reopened = store.update_status("42", TaskStatus::InProgress).await.unwrap();
        assert!(reopened.completed_at.is_none());

        let log = store.activity("42").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].old_value.as_deref(), Some("todo"));
        assert_eq!(log[0].new_value.as_deref(), Some("completed"));
        assert_eq!(log[0].source, ActivitySource::Manual);
    }

    #[tokio::test]
    async fn duplicate_ids_and_direct_archival_are_rejected() {
        let store = TaskStore::new(Database::open_in_memory().unwrap());
        let input = CreateTaskInput {
            id: Some("t1".to_string()),
            title: "Task".to_string(),
        };
        store.create(input.clone()).await.unwrap();
        assert!(matches!(store.create(input).await, Err(ServerError::Conflict(_))));
        assert!(matches!(
            store.update_status("t1", TaskStatus::Archived).await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            store.update_status("missing", TaskStatus::Completed).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_status_in_the_database_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        let store = TaskStore::new(db.clone());
        store
            .create(CreateTaskInput {
                id: Some("t9".to_string()),
                title: "Task".to_string(),
            })
            .await
            .unwrap();
        db.with_conn(|conn| conn.execute("UPDATE tasks SET status = 'shelved' WHERE id = 't9'", []))
            .unwrap();

        match store.get("t9").await {
            Err(ServerError::Database(msg)) => assert!(msg.contains("shelved"), "{}", msg),
            other => panic!("expected a database error, got {:?}", other),
        }
    }
}
