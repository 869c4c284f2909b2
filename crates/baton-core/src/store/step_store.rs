use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::run_store::{load_run, set_run_status};
use super::{json_column, ms_to_dt, opt_ms_to_dt, status_column, to_json};
use crate::db::Database;
use crate::error::ServerError;
use crate::models::run::RunStatus;
use crate::models::step::{Step, StepStatus};

pub(crate) const STEP_COLUMNS: &str = "id, run_id, step_index, step_id, agent_id, input_template, \
     expects, kind_config, status, output, error, retry_count, max_retries, current_story_id, \
     claimed_by, claimed_at, created_at, updated_at";

#[derive(Clone)]
pub struct StepStore {
    db: Database,
}

impl StepStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Count one more attempt against the step's retry budget.
    ///
    /// Returns the new retry count. The attempt that would exceed
    /// `max_retries` is refused: the step and its run are marked failed and
    /// `RetriesExhausted` is returned.
    pub async fn increment_retry(&self, id: &str) -> Result<u32, ServerError> {
        let id = id.to_string();
        let outcome = self
            .db
            .transaction(move |tx| {
                let step = load_step(tx, &id)?
                    .ok_or_else(|| ServerError::NotFound("Step not found".to_string()))?;
                let now = Utc::now();
                if let Some(count) = charge_step_retry(tx, &step.id, now)? {
                    return Ok(Ok(count));
                }
                set_step_status(tx, &step.id, StepStatus::Failed, now)?;
                if let Some(run) = load_run(tx, &step.run_id)? {
                    if run.status == RunStatus::Running {
                        set_run_status(tx, &run.id, RunStatus::Failed, now)?;
                    }
                }
                Ok(Err(step.max_retries))
            })
            .await?;
        outcome.map_err(|max_retries| ServerError::RetriesExhausted { max_retries })
    }
}

/// Charge one attempt to a step if its budget allows it. Returns the new
/// retry count, or `None` when `retry_count` has already reached `max_retries`.
pub(crate) fn charge_step_retry(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<Option<u32>> {
    conn.query_row(
        "UPDATE steps SET retry_count = retry_count + 1, updated_at = ?1
         WHERE id = ?2 AND retry_count < max_retries
         RETURNING retry_count",
        rusqlite::params![now.timestamp_millis(), id],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn load_step(conn: &Connection, id: &str) -> rusqlite::Result<Option<Step>> {
    conn.query_row(
        &format!("SELECT {} FROM steps WHERE id = ?1", STEP_COLUMNS),
        rusqlite::params![id],
        row_to_step,
    )
    .optional()
}

/// Find a step of a run by row id or by its template `step_id`.
pub(crate) fn find_run_step(
    conn: &Connection,
    run_id: &str,
    key: &str,
) -> rusqlite::Result<Option<Step>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM steps WHERE run_id = ?1 AND (id = ?2 OR step_id = ?2)
             ORDER BY step_index LIMIT 1",
            STEP_COLUMNS
        ),
        rusqlite::params![run_id, key],
        row_to_step,
    )
    .optional()
}

pub(crate) fn list_steps(conn: &Connection, run_id: &str) -> rusqlite::Result<Vec<Step>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM steps WHERE run_id = ?1 ORDER BY step_index",
        STEP_COLUMNS
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![run_id], row_to_step)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn insert_step(conn: &Connection, step: &Step) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO steps (id, run_id, step_index, step_id, agent_id, input_template, expects,
         kind, kind_config, status, output, error, retry_count, max_retries, current_story_id,
         claimed_by, claimed_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        rusqlite::params![
            step.id,
            step.run_id,
            step.step_index,
            step.step_id,
            step.agent_id,
            step.input_template,
            step.expects,
            step.kind.name(),
            to_json(&step.kind),
            step.status.as_str(),
            step.output,
            step.error,
            step.retry_count,
            step.max_retries,
            step.current_story_id,
            step.claimed_by,
            step.claimed_at.map(|t| t.timestamp_millis()),
            step.created_at.timestamp_millis(),
            step.updated_at.timestamp_millis(),
        ],
    )?;
    Ok(())
}

pub(crate) fn set_step_status(
    conn: &Connection,
    id: &str,
    status: StepStatus,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE steps SET status = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![status.as_str(), now.timestamp_millis(), id],
    )
}

/// Conditional status change: only applies if the step is still in `from`.
pub(crate) fn transition_step(
    conn: &Connection,
    id: &str,
    from: &[StepStatus],
    to: StepStatus,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let allowed = from
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    let n = conn.execute(
        &format!(
            "UPDATE steps SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
            allowed
        ),
        rusqlite::params![to.as_str(), now.timestamp_millis(), id],
    )?;
    Ok(n == 1)
}

pub(crate) fn set_step_output(
    conn: &Connection,
    id: &str,
    status: StepStatus,
    output: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE steps SET status = ?1, output = COALESCE(?2, output), updated_at = ?3 WHERE id = ?4",
        rusqlite::params![status.as_str(), output, now.timestamp_millis(), id],
    )?;
    Ok(())
}

pub(crate) fn set_step_error(
    conn: &Connection,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE steps SET status = 'failed', error = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![error, now.timestamp_millis(), id],
    )?;
    Ok(())
}

pub(crate) fn set_current_story(
    conn: &Connection,
    id: &str,
    story_id: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE steps SET current_story_id = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![story_id, now.timestamp_millis(), id],
    )?;
    Ok(())
}

fn row_to_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get(0)?,
        run_id: row.get(1)?,
        step_index: row.get(2)?,
        step_id: row.get(3)?,
        agent_id: row.get(4)?,
        input_template: row.get(5)?,
        expects: row.get(6)?,
        kind: json_column(row, 7)?,
        status: status_column(row, 8, StepStatus::from_str)?,
        output: row.get(9)?,
        error: row.get(10)?,
        retry_count: row.get(11)?,
        max_retries: row.get(12)?,
        current_story_id: row.get(13)?,
        claimed_by: row.get(14)?,
        claimed_at: opt_ms_to_dt(row.get(15)?),
        created_at: ms_to_dt(row.get(16)?),
        updated_at: ms_to_dt(row.get(17)?),
    })
}
