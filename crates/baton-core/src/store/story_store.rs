use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::run_store::{load_run, set_run_status};
use super::step_store::set_step_status;
use super::{json_column, ms_to_dt, opt_ms_to_dt, status_column, to_json};
use crate::db::Database;
use crate::error::ServerError;
use crate::models::run::RunStatus;
use crate::models::step::{Step, StepStatus};
use crate::models::story::{Story, StorySeed, StoryStatus};

const STORY_COLUMNS: &str = "id, step_id, run_id, story_index, story_id, title, description, \
     acceptance_criteria, status, output, error, retry_count, max_retries, claimed_by, \
     claimed_at, created_at, updated_at";

#[derive(Clone)]
pub struct StoryStore {
    db: Database,
}

impl StoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Story counterpart of `StepStore::increment_retry`. Exhaustion fails the
    /// story, its loop step and the run.
    pub async fn increment_retry(&self, id: &str) -> Result<u32, ServerError> {
        let id = id.to_string();
        let outcome = self
            .db
            .transaction(move |tx| {
                let story = load_story(tx, &id)?
                    .ok_or_else(|| ServerError::NotFound("Story not found".to_string()))?;
                let now = Utc::now();
                if let Some(count) = charge_story_retry(tx, &story.id, now)? {
                    return Ok(Ok(count));
                }
                set_story_status(tx, &story.id, StoryStatus::Failed, now)?;
                set_step_status(tx, &story.step_id, StepStatus::Failed, now)?;
                if let Some(run) = load_run(tx, &story.run_id)? {
                    if run.status == RunStatus::Running {
                        set_run_status(tx, &run.id, RunStatus::Failed, now)?;
                    }
                }
                Ok(Err(story.max_retries))
            })
            .await?;
        outcome.map_err(|max_retries| ServerError::RetriesExhausted { max_retries })
    }
}

/// Charge one attempt to a story if its budget allows it. Returns the new
/// retry count, or `None` when `retry_count` has already reached `max_retries`.
pub(crate) fn charge_story_retry(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<Option<u32>> {
    conn.query_row(
        "UPDATE stories SET retry_count = retry_count + 1, updated_at = ?1
         WHERE id = ?2 AND retry_count < max_retries
         RETURNING retry_count",
        rusqlite::params![now.timestamp_millis(), id],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn load_story(conn: &Connection, id: &str) -> rusqlite::Result<Option<Story>> {
    conn.query_row(
        &format!("SELECT {} FROM stories WHERE id = ?1", STORY_COLUMNS),
        rusqlite::params![id],
        row_to_story,
    )
    .optional()
}

/// Find a story of a run by row id or by its agent-assigned `story_id`.
pub(crate) fn find_run_story(
    conn: &Connection,
    run_id: &str,
    key: &str,
) -> rusqlite::Result<Option<Story>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM stories WHERE run_id = ?1 AND (id = ?2 OR story_id = ?2)
             ORDER BY created_at, story_index LIMIT 1",
            STORY_COLUMNS
        ),
        rusqlite::params![run_id, key],
        row_to_story,
    )
    .optional()
}

pub(crate) fn list_stories(conn: &Connection, step_id: &str) -> rusqlite::Result<Vec<Story>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM stories WHERE step_id = ?1 ORDER BY story_index",
        STORY_COLUMNS
    ))?;
    let rows = stmt
        .query_map(rusqlite::params![step_id], row_to_story)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lowest-index pending story of a loop step.
pub(crate) fn next_pending_story(
    conn: &Connection,
    step_id: &str,
) -> rusqlite::Result<Option<Story>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM stories WHERE step_id = ?1 AND status = 'pending'
             ORDER BY story_index LIMIT 1",
            STORY_COLUMNS
        ),
        rusqlite::params![step_id],
        row_to_story,
    )
    .optional()
}

/// Append stories to a loop step, numbering them after any existing ones.
pub(crate) fn insert_stories(
    conn: &Connection,
    step: &Step,
    seeds: &[StorySeed],
    max_retries: u32,
    now: DateTime<Utc>,
) -> rusqlite::Result<Vec<Story>> {
    let next_index: u32 = conn.query_row(
        "SELECT COALESCE(MAX(story_index) + 1, 0) FROM stories WHERE step_id = ?1",
        rusqlite::params![step.id],
        |row| row.get(0),
    )?;

    let mut created = Vec::with_capacity(seeds.len());
    for (offset, seed) in seeds.iter().enumerate() {
        let story = Story {
            id: Uuid::new_v4().to_string(),
            step_id: step.id.clone(),
            run_id: step.run_id.clone(),
            story_index: next_index + offset as u32,
            story_id: seed.id.clone(),
            title: seed.title.clone(),
            description: seed.description.clone(),
            acceptance_criteria: seed.acceptance_criteria.clone(),
            status: StoryStatus::Pending,
            output: None,
            error: None,
            retry_count: 0,
            max_retries,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO stories (id, step_id, run_id, story_index, story_id, title, description,
             acceptance_criteria, status, retry_count, max_retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                story.id,
                story.step_id,
                story.run_id,
                story.story_index,
                story.story_id,
                story.title,
                story.description,
                to_json(&story.acceptance_criteria),
                story.status.as_str(),
                story.retry_count,
                story.max_retries,
                now.timestamp_millis(),
                now.timestamp_millis(),
            ],
        )?;
        created.push(story);
    }
    Ok(created)
}

pub(crate) fn set_story_status(
    conn: &Connection,
    id: &str,
    status: StoryStatus,
    now: DateTime<Utc>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE stories SET status = ?1, updated_at = ?2 WHERE id = ?3",
        rusqlite::params![status.as_str(), now.timestamp_millis(), id],
    )
}

pub(crate) fn set_story_result(
    conn: &Connection,
    id: &str,
    status: StoryStatus,
    output: Option<&str>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE stories SET status = ?1, output = COALESCE(?2, output),
           error = COALESCE(?3, error), updated_at = ?4
         WHERE id = ?5",
        rusqlite::params![status.as_str(), output, error, now.timestamp_millis(), id],
    )?;
    Ok(())
}

/// Send a story back for another attempt, keeping `error` as feedback.
/// Returns `false` without touching the story when its budget is spent.
pub(crate) fn retry_story(
    conn: &Connection,
    id: &str,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    if charge_story_retry(conn, id, now)?.is_none() {
        return Ok(false);
    }
    conn.execute(
        "UPDATE stories SET status = 'pending', error = COALESCE(?1, error),
           claimed_by = NULL, claimed_at = NULL, updated_at = ?2
         WHERE id = ?3",
        rusqlite::params![error, now.timestamp_millis(), id],
    )?;
    Ok(true)
}

/// Count of a loop step's stories per status bucket.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoryTally {
    pub total: u32,
    pub pending: u32,
    pub active: u32,
    pub completed: u32,
    /// Failed with retries left; the requeue sweep will bring these back.
    pub retryable: u32,
    /// Failed with no retries left.
    pub exhausted: u32,
}

impl StoryTally {
    pub fn all_completed(&self) -> bool {
        self.completed == self.total
    }
}

pub(crate) fn tally_stories(conn: &Connection, step_id: &str) -> rusqlite::Result<StoryTally> {
    let mut stmt = conn.prepare(
        "SELECT status, retry_count >= max_retries, COUNT(*) FROM stories
         WHERE step_id = ?1 GROUP BY status, retry_count >= max_retries",
    )?;
    let rows = stmt.query_map(rusqlite::params![step_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, bool>(1)?,
            row.get::<_, u32>(2)?,
        ))
    })?;
    let mut tally = StoryTally::default();
    for row in rows {
        let (status, out_of_retries, n) = row?;
        tally.total += n;
        match StoryStatus::from_str(&status) {
            Some(StoryStatus::Pending) => tally.pending += n,
            Some(StoryStatus::Running | StoryStatus::Verifying) => tally.active += n,
            Some(StoryStatus::Completed) => tally.completed += n,
            Some(StoryStatus::Failed) if out_of_retries => tally.exhausted += n,
            Some(StoryStatus::Failed) => tally.retryable += n,
            None => {}
        }
    }
    Ok(tally)
}

/// First story in `verifying` under any of the given loop steps.
pub(crate) fn find_verifying_story(
    conn: &Connection,
    loop_step_ids: &[String],
) -> rusqlite::Result<Option<Story>> {
    for step_id in loop_step_ids {
        let found = conn
            .query_row(
                &format!(
                    "SELECT {} FROM stories WHERE step_id = ?1 AND status = 'verifying'
                     ORDER BY story_index LIMIT 1",
                    STORY_COLUMNS
                ),
                rusqlite::params![step_id],
                row_to_story,
            )
            .optional()?;
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

fn row_to_story(row: &rusqlite::Row<'_>) -> rusqlite::Result<Story> {
    Ok(Story {
        id: row.get(0)?,
        step_id: row.get(1)?,
        run_id: row.get(2)?,
        story_index: row.get(3)?,
        story_id: row.get(4)?,
        title: row.get(5)?,
        description: row.get(6)?,
        acceptance_criteria: json_column(row, 7)?,
        status: status_column(row, 8, StoryStatus::from_str)?,
        output: row.get(9)?,
        error: row.get(10)?,
        retry_count: row.get(11)?,
        max_retries: row.get(12)?,
        claimed_by: row.get(13)?,
        claimed_at: opt_ms_to_dt(row.get(14)?),
        created_at: ms_to_dt(row.get(15)?),
        updated_at: ms_to_dt(row.get(16)?),
    })
}
