use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::{json_column, ms_to_dt, opt_ms_to_dt, status_column, to_json};
use crate::db::Database;
use crate::error::ServerError;
use crate::models::run::{Run, RunContext, RunFilter, RunStatus};

const RUN_COLUMNS: &str =
    "id, workflow_id, task_id, status, context, created_at, started_at, completed_at, updated_at";

#[derive(Clone)]
pub struct RunStore {
    db: Database,
}

impl RunStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Run>, ServerError> {
        let id = id.to_string();
        self.db.with_conn_async(move |conn| load_run(conn, &id)).await
    }

    pub async fn list(&self, filter: RunFilter) -> Result<Vec<Run>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut sql = format!("SELECT {} FROM runs WHERE 1 = 1", RUN_COLUMNS);
                let mut params: Vec<String> = Vec::new();
                if let Some(status) = filter.status {
                    params.push(status.as_str().to_string());
                    sql.push_str(&format!(" AND status = ?{}", params.len()));
                }
                if let Some(task_id) = filter.task_id {
                    params.push(task_id);
                    sql.push_str(&format!(" AND task_id = ?{}", params.len()));
                }
                if let Some(workflow_id) = filter.workflow_id {
                    params.push(workflow_id);
                    sql.push_str(&format!(" AND workflow_id = ?{}", params.len()));
                }
                sql.push_str(" ORDER BY created_at DESC");

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), row_to_run)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

pub(crate) fn load_run(conn: &Connection, id: &str) -> rusqlite::Result<Option<Run>> {
    conn.query_row(
        &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
        rusqlite::params![id],
        row_to_run,
    )
    .optional()
}

pub(crate) fn insert_run(conn: &Connection, run: &Run) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO runs (id, workflow_id, task_id, status, context, created_at,
         started_at, completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            run.id,
            run.workflow_id,
            run.task_id,
            run.status.as_str(),
            to_json(&run.context),
            run.created_at.timestamp_millis(),
            run.started_at.map(|t| t.timestamp_millis()),
            run.completed_at.map(|t| t.timestamp_millis()),
            run.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub(crate) fn save_context(
    conn: &Connection,
    run_id: &str,
    context: &RunContext,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE runs SET context = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![to_json(context), now.timestamp_millis(), run_id],
    )?;
    Ok(())
}

/// Set a run's status, stamping `started_at` on first start and
/// `completed_at` on any terminal status.
pub(crate) fn set_run_status(
    conn: &Connection,
    run_id: &str,
    status: RunStatus,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    let now_ms = now.timestamp_millis();
    let completed_at = status.is_terminal().then_some(now_ms);
    conn.execute(
        "UPDATE runs SET status = ?1, updated_at = ?2,
           started_at = CASE WHEN ?1 = 'running' THEN COALESCE(started_at, ?2) ELSE started_at END,
           completed_at = ?3
         WHERE id = ?4",
        rusqlite::params![status.as_str(), now_ms, completed_at, run_id],
    )
}

/// Record progress on a run without changing its state.
pub(crate) fn touch_run(conn: &Connection, run_id: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE runs SET updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now.timestamp_millis(), run_id],
    )?;
    Ok(())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        task_id: row.get(2)?,
        status: status_column(row, 3, RunStatus::from_str)?,
        context: json_column(row, 4)?,
        created_at: ms_to_dt(row.get(5)?),
        started_at: opt_ms_to_dt(row.get(6)?),
        completed_at: opt_ms_to_dt(row.get(7)?),
        updated_at: ms_to_dt(row.get(8)?),
    })
}
