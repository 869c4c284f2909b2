//! Atomic claim of steps and stories.
//!
//! A claim is a conditional `UPDATE ... WHERE id = ? AND status IN (...)`; the
//! affected-row count decides whether this caller won. Losing a race is a
//! normal outcome (`None` or 409), never retried here.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::advance::{owning_step, verifying_story_for};
use super::orchestrator::{require_run, require_step, require_story, WorkflowEngine};
use super::template::resolve_template;
use crate::error::ServerError;
use crate::models::run::RunStatus;
use crate::models::step::{Step, StepStatus};
use crate::models::story::{Story, StoryStatus};
use crate::models::workflow::StepKind;
use crate::store::run_store::touch_run;
use crate::store::step_store::load_step;
use crate::store::story_store::{list_stories, load_story, next_pending_story};

/// A step handed to an agent, with its input rendered against the run context.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedStep {
    pub run_id: String,
    pub step: Step,
    /// Story being worked on (loop steps) or verified (verify steps).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story: Option<Story>,
    pub resolved_input: String,
}

/// A story handed to an agent through the story surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimedStory {
    pub run_id: String,
    pub story: Story,
    pub step: Step,
    pub resolved_input: String,
}

impl WorkflowEngine {
    /// Polling claim: the first pending unit for `agent_id` across running
    /// runs (or within `run_id`). `None` when nothing is available.
    pub async fn claim_next_step(
        &self,
        agent_id: &str,
        run_id: Option<&str>,
    ) -> Result<Option<ClaimedStep>, ServerError> {
        let agent_id = agent_id.to_string();
        let run_id = run_id.map(str::to_string);
        let claimed = self
            .db
            .transaction(move |tx| {
                claim_next_step_tx(tx, &agent_id, run_id.as_deref(), Utc::now())
            })
            .await?;
        if let Some(c) = &claimed {
            tracing::info!(
                "Agent {} claimed step {} of run {}",
                c.step.agent_id,
                c.step.step_id,
                c.run_id
            );
        }
        Ok(claimed)
    }

    /// Explicit claim of a named step.
    pub async fn claim_step(
        &self,
        run_id: &str,
        step_key: &str,
        agent_id: &str,
    ) -> Result<ClaimedStep, ServerError> {
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        let agent_id = agent_id.to_string();
        let claimed = self
            .db
            .transaction(move |tx| claim_step_tx(tx, &run_id, &step_key, &agent_id, Utc::now()))
            .await?;
        tracing::info!(
            "Agent {} claimed step {} of run {}",
            claimed.step.agent_id,
            claimed.step.step_id,
            claimed.run_id
        );
        Ok(claimed)
    }

    /// Next pending story of a loop step. `None` when the run is not running,
    /// the loop is busy or no story is pending.
    pub async fn claim_story(
        &self,
        run_id: &str,
        step_key: &str,
        claimed_by: Option<&str>,
    ) -> Result<Option<ClaimedStory>, ServerError> {
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        let claimed_by = claimed_by.map(str::to_string);
        self.db
            .transaction(move |tx| {
                let now = Utc::now();
                let run = require_run(tx, &run_id)?;
                let step = require_step(tx, &run_id, &step_key)?;
                if !step.is_loop() {
                    return Err(ServerError::BadRequest(format!(
                        "Step {} is not a loop step",
                        step.step_id
                    )));
                }
                if run.status != RunStatus::Running {
                    return Ok(None);
                }
                let Some(story) = next_pending_story(tx, &step.id)? else {
                    return Ok(None);
                };
                let agent = claimed_by.as_deref().unwrap_or(&step.agent_id);
                if !claim_loop(tx, &step, &[StepStatus::Pending], &story, agent, now)? {
                    return Ok(None);
                }
                claimed_story(tx, &run.id, &step.id, &story.id).map(Some)
            })
            .await
    }

    /// Claim a named story.
    pub async fn start_story(
        &self,
        run_id: &str,
        story_key: &str,
        claimed_by: Option<&str>,
    ) -> Result<ClaimedStory, ServerError> {
        let run_id = run_id.to_string();
        let story_key = story_key.to_string();
        let claimed_by = claimed_by.map(str::to_string);
        self.db
            .transaction(move |tx| {
                let now = Utc::now();
                let run = require_run(tx, &run_id)?;
                if run.status != RunStatus::Running {
                    return Err(ServerError::invalid_state(
                        "Run is not running",
                        run.status.as_str(),
                    ));
                }
                let story = require_story(tx, &run_id, &story_key)?;
                if story.status != StoryStatus::Pending {
                    return Err(ServerError::not_claimable(
                        format!("Story {} is not claimable", story.story_id),
                        story.status.as_str(),
                    ));
                }
                let step = owning_step(tx, &story)?;
                match step.status {
                    StepStatus::Pending => {}
                    StepStatus::Running => {
                        return Err(ServerError::not_claimable(
                            format!("Loop step {} is busy with another story", step.step_id),
                            step.status.as_str(),
                        ));
                    }
                    other => {
                        return Err(ServerError::not_claimable(
                            format!("Loop step {} is {}", step.step_id, other),
                            other.as_str(),
                        ));
                    }
                }
                let agent = claimed_by.as_deref().unwrap_or(&step.agent_id);
                if !claim_loop(tx, &step, &[StepStatus::Pending], &story, agent, now)? {
                    return Err(ServerError::not_claimable(
                        format!("Loop step {} is busy with another story", step.step_id),
                        StepStatus::Running.as_str(),
                    ));
                }
                claimed_story(tx, &run.id, &step.id, &story.id)
            })
            .await
    }
}

fn claim_next_step_tx(
    tx: &Connection,
    agent_id: &str,
    run_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<ClaimedStep>, ServerError> {
    let mut stmt = tx.prepare(
        "SELECT s.id FROM steps s JOIN runs r ON r.id = s.run_id
         WHERE r.status = 'running' AND s.agent_id = ?1 AND s.status = 'pending'
           AND (?2 IS NULL OR s.run_id = ?2)
         ORDER BY r.created_at, s.step_index",
    )?;
    let candidates = stmt
        .query_map(rusqlite::params![agent_id, run_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    for id in candidates {
        let Some(step) = load_step(tx, &id)? else {
            continue;
        };
        if let Some(claimed) = try_claim(tx, &step, &[StepStatus::Pending], agent_id, now)? {
            return Ok(Some(claimed));
        }
    }
    Ok(None)
}

fn claim_step_tx(
    tx: &Connection,
    run_id: &str,
    step_key: &str,
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<ClaimedStep, ServerError> {
    let run = require_run(tx, run_id)?;
    let step = require_step(tx, run_id, step_key)?;
    if run.status != RunStatus::Running {
        return Err(ServerError::invalid_state(
            "Run is not running",
            run.status.as_str(),
        ));
    }
    if step.agent_id != agent_id {
        return Err(ServerError::Forbidden(format!(
            "Step {} is assigned to agent {}",
            step.step_id, step.agent_id
        )));
    }
    if !step.status.is_claimable() {
        return Err(ServerError::not_claimable(
            format!("Step {} is not claimable", step.step_id),
            step.status.as_str(),
        ));
    }
    try_claim(
        tx,
        &step,
        &[StepStatus::Waiting, StepStatus::Pending],
        agent_id,
        now,
    )?
    .ok_or_else(|| {
        let reason = if step.is_loop() {
            format!("Step {} has no pending story", step.step_id)
        } else {
            format!("Step {} is not claimable", step.step_id)
        };
        ServerError::not_claimable(reason, step.status.as_str())
    })
}

/// Attempt the conditional write for one step. `Ok(None)` means another
/// caller got there first, or a loop step had no pending story.
fn try_claim(
    tx: &Connection,
    step: &Step,
    from: &[StepStatus],
    agent_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<ClaimedStep>, ServerError> {
    let story = match &step.kind {
        StepKind::Loop(_) => {
            let Some(story) = next_pending_story(tx, &step.id)? else {
                return Ok(None);
            };
            if !claim_loop(tx, step, from, &story, agent_id, now)? {
                return Ok(None);
            }
            load_story(tx, &story.id)?
        }
        StepKind::Single | StepKind::Approval(_) => {
            if !claim_plain(tx, step, from, agent_id, now)? {
                return Ok(None);
            }
            verifying_story_for(tx, step)?
        }
    };
    touch_run(tx, &step.run_id, now)?;

    let step = load_step(tx, &step.id)?
        .ok_or_else(|| ServerError::NotFound("Step not found".to_string()))?;
    let resolved_input = resolve_input(tx, &step, story.as_ref())?;
    Ok(Some(ClaimedStep {
        run_id: step.run_id.clone(),
        step,
        story,
        resolved_input,
    }))
}

fn status_list(from: &[StepStatus]) -> String {
    from.iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn claim_plain(
    tx: &Connection,
    step: &Step,
    from: &[StepStatus],
    agent_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let n = tx.execute(
        &format!(
            "UPDATE steps SET status = 'running', claimed_by = ?1, claimed_at = ?2,
               previous_status = status, updated_at = ?2
             WHERE id = ?3 AND status IN ({})",
            status_list(from)
        ),
        rusqlite::params![agent_id, now.timestamp_millis(), step.id],
    )?;
    Ok(n == 1)
}

/// Claim `story` and flip its loop step to `running` in one go. The story
/// write is undone if the step write loses.
fn claim_loop(
    tx: &Connection,
    step: &Step,
    from: &[StepStatus],
    story: &Story,
    agent_id: &str,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let now_ms = now.timestamp_millis();
    let n = tx.execute(
        "UPDATE stories SET status = 'running', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
         WHERE id = ?3 AND step_id = ?4 AND status = 'pending'",
        rusqlite::params![agent_id, now_ms, story.id, step.id],
    )?;
    if n != 1 {
        return Ok(false);
    }
    let n = tx.execute(
        &format!(
            "UPDATE steps SET status = 'running', current_story_id = ?1, claimed_by = ?2,
               claimed_at = ?3, previous_status = status, updated_at = ?3
             WHERE id = ?4 AND status IN ({})",
            status_list(from)
        ),
        rusqlite::params![story.id, agent_id, now_ms, step.id],
    )?;
    if n != 1 {
        tx.execute(
            "UPDATE stories SET status = 'pending', claimed_by = NULL, claimed_at = NULL
             WHERE id = ?1",
            rusqlite::params![story.id],
        )?;
        return Ok(false);
    }
    Ok(true)
}

fn claimed_story(
    tx: &Connection,
    run_id: &str,
    step_id: &str,
    story_id: &str,
) -> Result<ClaimedStory, ServerError> {
    touch_run(tx, run_id, Utc::now())?;
    let step =
        load_step(tx, step_id)?.ok_or_else(|| ServerError::NotFound("Step not found".to_string()))?;
    let story = load_story(tx, story_id)?
        .ok_or_else(|| ServerError::NotFound("Story not found".to_string()))?;
    let resolved_input = resolve_input(tx, &step, Some(&story))?;
    tracing::info!(
        "Story {} of step {} claimed by {}",
        story.story_id,
        step.step_id,
        story.claimed_by.as_deref().unwrap_or("-")
    );
    Ok(ClaimedStory {
        run_id: run_id.to_string(),
        story,
        step,
        resolved_input,
    })
}

/// Render a step's input template against the run context, extended with the
/// story keys when a story is involved.
fn resolve_input(tx: &Connection, step: &Step, story: Option<&Story>) -> Result<String, ServerError> {
    let mut context = require_run(tx, &step.run_id)?.context;
    if let Some(story) = story {
        let siblings = list_stories(tx, &story.step_id)?;
        let completed = siblings
            .iter()
            .filter(|s| s.status == StoryStatus::Completed)
            .map(|s| format!("{}: {}", s.story_id, s.title))
            .collect::<Vec<_>>()
            .join("\n");
        let remaining = siblings
            .iter()
            .filter(|s| s.id != story.id && !s.status.is_terminal())
            .count();
        let feedback = match (&story.error, story.retry_count) {
            (Some(error), n) if n > 0 => error.clone(),
            _ => String::new(),
        };

        context.insert("current_story".to_string(), story.render());
        context.insert("current_story_id".to_string(), story.story_id.clone());
        context.insert("current_story_title".to_string(), story.title.clone());
        context.insert("completed_stories".to_string(), completed);
        context.insert("stories_remaining".to_string(), remaining.to_string());
        context.insert("verify_feedback".to_string(), feedback);
    }
    Ok(resolve_template(&step.input_template, &context))
}
