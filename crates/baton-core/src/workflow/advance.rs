//! Pipeline advancement: completion, failure and manual transitions of steps
//! and stories, loop bookkeeping, and run completion.
//!
//! Every public operation here runs as one IMMEDIATE transaction: the context
//! merge, story creation, unit transition, next-step promotion and run
//! completion either all land or none do.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use super::orchestrator::{require_run, require_step, require_story, WorkflowEngine};
use super::output::{merge_context_from_output, parse_structured_stories};
use crate::error::ServerError;
use crate::models::run::{RunContext, RunStatus};
use crate::models::step::{Step, StepStatus, UnitOutput, UpdateStepInput};
use crate::models::story::{Story, StoryStatus, UpdateStoryInput};
use crate::models::workflow::{LoopConfig, StepKind};
use crate::store::run_store::{save_context, set_run_status, touch_run};
use crate::store::step_store::{
    find_run_step, list_steps, load_step, set_current_story, set_step_error, set_step_output,
    set_step_status, transition_step,
};
use crate::store::story_store::{
    find_verifying_story, insert_stories, load_story, retry_story, set_story_result,
    tally_stories,
};

/// Result of a completion call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub step_status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_status: Option<StoryStatus>,
    /// The addressed unit (step, or story for loop steps) reached `completed`.
    pub completed: bool,
    pub run_completed: bool,
    pub run_status: RunStatus,
    /// Stories created from a `STORIES_JSON` block in the output.
    pub stories_added: usize,
}

/// Result of a failure report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureOutcome {
    pub will_retry: bool,
    pub status: String,
    pub run_status: RunStatus,
}

impl WorkflowEngine {
    /// Complete a running step with the agent's raw output.
    pub async fn complete_step(
        &self,
        run_id: &str,
        step_key: &str,
        output: UnitOutput,
    ) -> Result<CompletionOutcome, ServerError> {
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        let text = output.to_text();
        self.db
            .transaction(move |tx| complete_step_tx(tx, &run_id, &step_key, &text, Utc::now()))
            .await
    }

    /// Report a running step as failed. Loop steps fail their current story.
    pub async fn fail_step(
        &self,
        run_id: &str,
        step_key: &str,
        error: &str,
    ) -> Result<FailureOutcome, ServerError> {
        let error = require_error(error)?;
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        let outcome = self
            .db
            .transaction(move |tx| fail_step_tx(tx, &run_id, &step_key, &error, Utc::now()))
            .await?;
        if !outcome.will_retry {
            tracing::warn!("Step failed with no retries left; run is {}", outcome.run_status);
        }
        Ok(outcome)
    }

    /// Manual and approval transitions of a step.
    pub async fn update_step(
        &self,
        run_id: &str,
        step_key: &str,
        input: UpdateStepInput,
    ) -> Result<Step, ServerError> {
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        self.db
            .transaction(move |tx| update_step_tx(tx, &run_id, &step_key, input, Utc::now()))
            .await
    }

    pub async fn complete_story(
        &self,
        run_id: &str,
        story_key: &str,
        output: UnitOutput,
    ) -> Result<CompletionOutcome, ServerError> {
        let run_id = run_id.to_string();
        let story_key = story_key.to_string();
        let text = output.to_text();
        self.db
            .transaction(move |tx| complete_story_tx(tx, &run_id, &story_key, &text, Utc::now()))
            .await
    }

    pub async fn fail_story(
        &self,
        run_id: &str,
        story_key: &str,
        error: &str,
    ) -> Result<FailureOutcome, ServerError> {
        let error = require_error(error)?;
        let run_id = run_id.to_string();
        let story_key = story_key.to_string();
        self.db
            .transaction(move |tx| {
                let now = Utc::now();
                let run = require_run(tx, &run_id)?;
                let story = require_story(tx, &run_id, &story_key)?;
                let loop_step = owning_step(tx, &story)?;
                fail_story_unit(tx, &run.id, &loop_step, &story, &error, now)
            })
            .await
    }

    /// Manual transitions of a story.
    pub async fn update_story(
        &self,
        run_id: &str,
        story_key: &str,
        input: UpdateStoryInput,
    ) -> Result<Story, ServerError> {
        let run_id = run_id.to_string();
        let story_key = story_key.to_string();
        self.db
            .transaction(move |tx| update_story_tx(tx, &run_id, &story_key, input, Utc::now()))
            .await
    }
}

fn require_error(error: &str) -> Result<String, ServerError> {
    let error = error.trim();
    if error.is_empty() {
        return Err(ServerError::BadRequest("error message is required".to_string()));
    }
    Ok(error.to_string())
}

// ─── Completion ────────────────────────────────────────────────────────

pub(crate) fn complete_step_tx(
    tx: &Connection,
    run_id: &str,
    step_key: &str,
    text: &str,
    now: DateTime<Utc>,
) -> Result<CompletionOutcome, ServerError> {
    let run = require_run(tx, run_id)?;
    let step = require_step(tx, run_id, step_key)?;
    if step.status != StepStatus::Running {
        return Err(ServerError::invalid_state(
            format!("Step {} cannot be completed", step.step_id),
            step.status.as_str(),
        ));
    }

    let stories_added = absorb_output(tx, &run.id, &step, text, now)?;

    let (story_status, completed) = if let Some(story) = verifying_story_for(tx, &step)? {
        let status = finalize_verification(tx, &run.id, &step, &story, text, now)?;
        (Some(status), status == StoryStatus::Completed)
    } else {
        match &step.kind {
            StepKind::Single => {
                set_step_output(tx, &step.id, StepStatus::Completed, Some(text), now)?;
                advance_pipeline(tx, &run.id, now)?;
                (None, true)
            }
            StepKind::Approval(_) => {
                set_step_output(tx, &step.id, StepStatus::AwaitingApproval, Some(text), now)?;
                tracing::info!("Step {} is awaiting approval", step.step_id);
                (None, false)
            }
            StepKind::Loop(cfg) => {
                let story = current_story(tx, &step)?;
                let status = complete_story_unit(tx, &run.id, &step, cfg, &story, text, now)?;
                (Some(status), status == StoryStatus::Completed)
            }
        }
    };

    outcome(tx, &run.id, &step.id, story_status, completed, stories_added)
}

fn complete_story_tx(
    tx: &Connection,
    run_id: &str,
    story_key: &str,
    text: &str,
    now: DateTime<Utc>,
) -> Result<CompletionOutcome, ServerError> {
    let run = require_run(tx, run_id)?;
    let story = require_story(tx, run_id, story_key)?;
    let loop_step = owning_step(tx, &story)?;
    let cfg = loop_config(&loop_step)?;
    if story.status != StoryStatus::Running {
        return Err(ServerError::invalid_state(
            format!("Story {} cannot be completed", story.story_id),
            story.status.as_str(),
        ));
    }
    let stories_added = absorb_output(tx, &run.id, &loop_step, text, now)?;
    let status = complete_story_unit(tx, &run.id, &loop_step, &cfg, &story, text, now)?;
    outcome(
        tx,
        &run.id,
        &loop_step.id,
        Some(status),
        status == StoryStatus::Completed,
        stories_added,
    )
}

fn outcome(
    tx: &Connection,
    run_id: &str,
    step_id: &str,
    story_status: Option<StoryStatus>,
    completed: bool,
    stories_added: usize,
) -> Result<CompletionOutcome, ServerError> {
    let step_status = load_step(tx, step_id)?
        .map(|s| s.status)
        .ok_or_else(|| ServerError::NotFound("Step not found".to_string()))?;
    let run_status = require_run(tx, run_id)?.status;
    Ok(CompletionOutcome {
        step_status,
        story_status,
        completed,
        run_completed: run_status == RunStatus::Completed,
        run_status,
        stories_added,
    })
}

/// Merge `KEY: value` lines into the run context and attach any structured
/// story list to the next waiting loop step. A malformed list aborts.
fn absorb_output(
    tx: &Connection,
    run_id: &str,
    step: &Step,
    text: &str,
    now: DateTime<Utc>,
) -> Result<usize, ServerError> {
    let run = require_run(tx, run_id)?;
    let context = merge_context_from_output(text, &run.context);
    save_context(tx, run_id, &context, now)?;

    let seeds = parse_structured_stories(text)?;
    if seeds.is_empty() {
        return Ok(0);
    }
    let target = list_steps(tx, run_id)?.into_iter().find(|s| {
        s.step_index > step.step_index && s.is_loop() && s.status == StepStatus::Waiting
    });
    let Some(target) = target else {
        tracing::warn!(
            "Step {} emitted {} stories but no waiting loop step follows it",
            step.step_id,
            seeds.len()
        );
        return Ok(0);
    };
    let max_retries = target
        .kind
        .loop_config()
        .and_then(|cfg| cfg.max_story_retries)
        .unwrap_or(target.max_retries);
    let created = insert_stories(tx, &target, &seeds, max_retries, now)?;
    tracing::info!("Attached {} stories to loop step {}", created.len(), target.step_id);
    Ok(created.len())
}

/// Promote the lowest-index waiting step, or complete the run when every
/// step is completed. Does nothing unless the run is `running`.
///
/// A promoted loop step with no stories has nothing to wait for and is
/// completed on the spot.
pub(crate) fn advance_pipeline(
    tx: &Connection,
    run_id: &str,
    now: DateTime<Utc>,
) -> Result<RunStatus, ServerError> {
    loop {
        let run = require_run(tx, run_id)?;
        if run.status != RunStatus::Running {
            return Ok(run.status);
        }
        let steps = list_steps(tx, run_id)?;
        match steps.iter().find(|s| s.status == StepStatus::Waiting) {
            Some(next) => {
                transition_step(tx, &next.id, &[StepStatus::Waiting], StepStatus::Pending, now)?;
                if let StepKind::Loop(cfg) = &next.kind {
                    if tally_stories(tx, &next.id)?.total == 0 {
                        tracing::info!("Loop step {} has no stories; completing it", next.step_id);
                        finish_loop(tx, run_id, next, cfg, now)?;
                        continue;
                    }
                }
                touch_run(tx, run_id, now)?;
                tracing::debug!("Step {} is now pending", next.step_id);
                return Ok(RunStatus::Running);
            }
            None if steps.iter().all(|s| s.status == StepStatus::Completed) => {
                set_run_status(tx, run_id, RunStatus::Completed, now)?;
                tracing::info!("Run {} completed", run_id);
                return Ok(RunStatus::Completed);
            }
            None => {
                touch_run(tx, run_id, now)?;
                return Ok(RunStatus::Running);
            }
        }
    }
}

fn fail_run(tx: &Connection, run_id: &str, now: DateTime<Utc>) -> Result<(), ServerError> {
    let run = require_run(tx, run_id)?;
    if !run.status.is_terminal() {
        set_run_status(tx, run_id, RunStatus::Failed, now)?;
        tracing::warn!("Run {} failed", run_id);
    }
    Ok(())
}

// ─── Loop / story state machine ────────────────────────────────────────

fn loop_config(step: &Step) -> Result<LoopConfig, ServerError> {
    step.kind.loop_config().cloned().ok_or_else(|| {
        ServerError::BadRequest(format!("Step {} is not a loop step", step.step_id))
    })
}

pub(crate) fn owning_step(tx: &Connection, story: &Story) -> Result<Step, ServerError> {
    load_step(tx, &story.step_id)?.ok_or_else(|| ServerError::NotFound("Step not found".to_string()))
}

fn current_story(tx: &Connection, loop_step: &Step) -> Result<Story, ServerError> {
    let story_id = loop_step.current_story_id.as_deref().ok_or_else(|| {
        ServerError::invalid_state(
            format!("Loop step {} has no story in progress", loop_step.step_id),
            loop_step.status.as_str(),
        )
    })?;
    load_story(tx, story_id)?.ok_or_else(|| ServerError::NotFound("Story not found".to_string()))
}

/// The story a verify step is currently checking, if `step` verifies a loop.
pub(crate) fn verifying_story_for(
    tx: &Connection,
    step: &Step,
) -> Result<Option<Story>, ServerError> {
    if step.is_loop() {
        return Ok(None);
    }
    let loops: Vec<String> = list_steps(tx, &step.run_id)?
        .into_iter()
        .filter(|s| {
            s.kind
                .loop_config()
                .and_then(|cfg| cfg.verify_step.as_deref())
                == Some(step.step_id.as_str())
        })
        .map(|s| s.id)
        .collect();
    if loops.is_empty() {
        return Ok(None);
    }
    Ok(find_verifying_story(tx, &loops)?)
}

/// A running story reports its output. With `verify_each` it moves to
/// `verifying` and the verify step is queued; otherwise it completes.
fn complete_story_unit(
    tx: &Connection,
    run_id: &str,
    loop_step: &Step,
    cfg: &LoopConfig,
    story: &Story,
    text: &str,
    now: DateTime<Utc>,
) -> Result<StoryStatus, ServerError> {
    if story.status != StoryStatus::Running {
        return Err(ServerError::invalid_state(
            format!("Story {} cannot be completed", story.story_id),
            story.status.as_str(),
        ));
    }

    let status = match (cfg.verify_each, cfg.verify_step.as_deref()) {
        (true, Some(verify_key)) => {
            set_story_result(tx, &story.id, StoryStatus::Verifying, Some(text), None, now)?;
            let verify = find_run_step(tx, run_id, verify_key)?.ok_or_else(|| {
                ServerError::Internal(format!("verify step '{}' is missing", verify_key))
            })?;
            transition_step(
                tx,
                &verify.id,
                &[StepStatus::Waiting, StepStatus::Completed],
                StepStatus::Pending,
                now,
            )?;
            StoryStatus::Verifying
        }
        _ => {
            set_story_result(tx, &story.id, StoryStatus::Completed, Some(text), None, now)?;
            StoryStatus::Completed
        }
    };
    sync_loop_step(tx, run_id, loop_step, now)?;
    Ok(status)
}

/// The verify step reported on a `verifying` story.
///
/// `STATUS: retry` (or `fail`) sends the story back with the feedback while
/// retries remain and fails it otherwise; anything else completes it. The
/// verify step goes back to `waiting` for the next story.
fn finalize_verification(
    tx: &Connection,
    run_id: &str,
    verify_step: &Step,
    story: &Story,
    text: &str,
    now: DateTime<Utc>,
) -> Result<StoryStatus, ServerError> {
    let verdict = merge_context_from_output(text, &RunContext::new());
    let rejected = verdict
        .get("status")
        .map(|s| matches!(s.to_lowercase().as_str(), "retry" | "fail" | "failed"))
        .unwrap_or(false);

    set_step_output(tx, &verify_step.id, StepStatus::Waiting, Some(text), now)?;

    let status = if rejected {
        let feedback = verdict
            .get("feedback")
            .or_else(|| verdict.get("issues"))
            .cloned()
            .unwrap_or_else(|| text.trim().to_string());
        if retry_story(tx, &story.id, Some(&feedback), now)? {
            tracing::info!(
                "Story {} sent back by verification (attempt {}/{})",
                story.story_id,
                story.retry_count + 1,
                story.max_retries
            );
            StoryStatus::Pending
        } else {
            set_story_result(tx, &story.id, StoryStatus::Failed, None, Some(&feedback), now)?;
            StoryStatus::Failed
        }
    } else {
        set_story_result(tx, &story.id, StoryStatus::Completed, None, None, now)?;
        StoryStatus::Completed
    };

    let loop_step = owning_step(tx, story)?;
    sync_loop_step(tx, run_id, &loop_step, now)?;
    Ok(status)
}

fn fail_story_unit(
    tx: &Connection,
    run_id: &str,
    loop_step: &Step,
    story: &Story,
    error: &str,
    now: DateTime<Utc>,
) -> Result<FailureOutcome, ServerError> {
    if !matches!(story.status, StoryStatus::Running | StoryStatus::Verifying) {
        return Err(ServerError::invalid_state(
            format!("Story {} cannot be failed", story.story_id),
            story.status.as_str(),
        ));
    }
    if story.status == StoryStatus::Verifying {
        release_verify_step(tx, run_id, loop_step, now)?;
    }
    set_story_result(tx, &story.id, StoryStatus::Failed, None, Some(error), now)?;
    let will_retry = story.retry_count < story.max_retries;
    sync_loop_step(tx, run_id, loop_step, now)?;
    Ok(FailureOutcome {
        will_retry,
        status: StoryStatus::Failed.as_str().to_string(),
        run_status: require_run(tx, run_id)?.status,
    })
}

/// Put a queued verify step back to `waiting` when its story went away.
fn release_verify_step(
    tx: &Connection,
    run_id: &str,
    loop_step: &Step,
    now: DateTime<Utc>,
) -> Result<(), ServerError> {
    let verify_key = loop_step
        .kind
        .loop_config()
        .and_then(|cfg| cfg.verify_step.as_deref());
    if let Some(verify_key) = verify_key {
        if let Some(verify) = find_run_step(tx, run_id, verify_key)? {
            transition_step(tx, &verify.id, &[StepStatus::Pending], StepStatus::Waiting, now)?;
        }
    }
    Ok(())
}

/// Recompute a loop step's status from its stories.
///
/// Any story out of retries fails the loop and the run. All stories
/// completed finishes the loop and advances the pipeline. Otherwise the loop
/// is `running` while a story is in flight and `pending` when one can be
/// claimed.
pub(crate) fn sync_loop_step(
    tx: &Connection,
    run_id: &str,
    loop_step: &Step,
    now: DateTime<Utc>,
) -> Result<StepStatus, ServerError> {
    let cfg = loop_config(loop_step)?;
    let tally = tally_stories(tx, &loop_step.id)?;

    if tally.exhausted > 0 {
        set_step_status(tx, &loop_step.id, StepStatus::Failed, now)?;
        set_current_story(tx, &loop_step.id, None, now)?;
        release_verify_step(tx, run_id, loop_step, now)?;
        fail_run(tx, run_id, now)?;
        return Ok(StepStatus::Failed);
    }
    if tally.total > 0 && tally.all_completed() {
        finish_loop(tx, run_id, loop_step, &cfg, now)?;
        advance_pipeline(tx, run_id, now)?;
        return Ok(StepStatus::Completed);
    }

    let status = if tally.active > 0 {
        StepStatus::Running
    } else {
        StepStatus::Pending
    };
    set_step_status(tx, &loop_step.id, status, now)?;
    if status == StepStatus::Pending {
        set_current_story(tx, &loop_step.id, None, now)?;
    }
    touch_run(tx, run_id, now)?;
    Ok(status)
}

fn finish_loop(
    tx: &Connection,
    run_id: &str,
    loop_step: &Step,
    cfg: &LoopConfig,
    now: DateTime<Utc>,
) -> Result<(), ServerError> {
    set_step_status(tx, &loop_step.id, StepStatus::Completed, now)?;
    set_current_story(tx, &loop_step.id, None, now)?;
    // The verify step only ran per story when verify_each is on.
    if let (true, Some(verify_key)) = (cfg.verify_each, cfg.verify_step.as_deref()) {
        if let Some(verify) = find_run_step(tx, run_id, verify_key)? {
            set_step_status(tx, &verify.id, StepStatus::Completed, now)?;
        }
    }
    tracing::info!("Loop step {} finished", loop_step.step_id);
    Ok(())
}

// ─── Failure ───────────────────────────────────────────────────────────

fn fail_step_tx(
    tx: &Connection,
    run_id: &str,
    step_key: &str,
    error: &str,
    now: DateTime<Utc>,
) -> Result<FailureOutcome, ServerError> {
    let run = require_run(tx, run_id)?;
    let step = require_step(tx, run_id, step_key)?;

    if step.is_loop() {
        let story = current_story(tx, &step)?;
        return fail_story_unit(tx, &run.id, &step, &story, error, now);
    }
    if step.status != StepStatus::Running {
        return Err(ServerError::invalid_state(
            format!("Step {} cannot be failed", step.step_id),
            step.status.as_str(),
        ));
    }

    set_step_error(tx, &step.id, error, now)?;
    let will_retry = step.retry_count < step.max_retries;
    if will_retry {
        touch_run(tx, &run.id, now)?;
    } else {
        fail_run(tx, &run.id, now)?;
    }
    Ok(FailureOutcome {
        will_retry,
        status: StepStatus::Failed.as_str().to_string(),
        run_status: require_run(tx, &run.id)?.status,
    })
}

// ─── Manual transitions ────────────────────────────────────────────────

fn update_step_tx(
    tx: &Connection,
    run_id: &str,
    step_key: &str,
    input: UpdateStepInput,
    now: DateTime<Utc>,
) -> Result<Step, ServerError> {
    let run = require_run(tx, run_id)?;
    let step = require_step(tx, run_id, step_key)?;
    let output = input.output.map(|o| o.to_text());

    match input.status {
        None => {
            if let Some(text) = output.as_deref() {
                set_step_output(tx, &step.id, step.status, Some(text), now)?;
            }
        }
        Some(StepStatus::Completed) => match step.status {
            StepStatus::AwaitingApproval => {
                set_step_output(tx, &step.id, StepStatus::Completed, output.as_deref(), now)?;
                tracing::info!("Step {} approved", step.step_id);
                advance_pipeline(tx, &run.id, now)?;
            }
            StepStatus::Running => {
                complete_step_tx(tx, &run.id, &step.id, output.as_deref().unwrap_or(""), now)?;
            }
            other => {
                return Err(ServerError::invalid_state(
                    format!("Step {} cannot be marked completed", step.step_id),
                    other.as_str(),
                ));
            }
        },
        Some(StepStatus::Failed) => match step.status {
            StepStatus::AwaitingApproval
            | StepStatus::Running
            | StepStatus::Pending
            | StepStatus::Waiting => {
                let reason = match (step.status, output.as_deref()) {
                    (_, Some(text)) if !text.trim().is_empty() => text.trim().to_string(),
                    (StepStatus::AwaitingApproval, _) => "Rejected".to_string(),
                    _ => "Marked failed".to_string(),
                };
                set_step_error(tx, &step.id, &reason, now)?;
                tracing::info!("Step {} marked failed: {}", step.step_id, reason);
                fail_run(tx, &run.id, now)?;
            }
            other => {
                return Err(ServerError::invalid_state(
                    format!("Step {} cannot be marked failed", step.step_id),
                    other.as_str(),
                ));
            }
        },
        Some(StepStatus::Pending) => match step.status {
            StepStatus::Failed | StepStatus::Waiting => {
                tx.execute(
                    "UPDATE steps SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                       updated_at = ?1
                     WHERE id = ?2",
                    rusqlite::params![now.timestamp_millis(), step.id],
                )?;
                touch_run(tx, &run.id, now)?;
            }
            other => {
                return Err(ServerError::invalid_state(
                    format!("Step {} cannot be requeued", step.step_id),
                    other.as_str(),
                ));
            }
        },
        Some(other) => {
            return Err(ServerError::BadRequest(format!(
                "Cannot set step status to {}; use claim or complete",
                other
            )));
        }
    }

    load_step(tx, &step.id)?.ok_or_else(|| ServerError::NotFound("Step not found".to_string()))
}

fn update_story_tx(
    tx: &Connection,
    run_id: &str,
    story_key: &str,
    input: UpdateStoryInput,
    now: DateTime<Utc>,
) -> Result<Story, ServerError> {
    let run = require_run(tx, run_id)?;
    let story = require_story(tx, run_id, story_key)?;
    let loop_step = owning_step(tx, &story)?;
    let output = input.output.map(|o| o.to_text());

    match input.status {
        None => {
            if let Some(text) = output.as_deref() {
                set_story_result(tx, &story.id, story.status, Some(text), None, now)?;
            }
        }
        Some(StoryStatus::Completed) if !story.status.is_terminal() => {
            if story.status == StoryStatus::Verifying {
                release_verify_step(tx, &run.id, &loop_step, now)?;
            }
            set_story_result(tx, &story.id, StoryStatus::Completed, output.as_deref(), None, now)?;
            sync_loop_step(tx, &run.id, &loop_step, now)?;
        }
        Some(StoryStatus::Failed) if !story.status.is_terminal() => {
            if story.status == StoryStatus::Verifying {
                release_verify_step(tx, &run.id, &loop_step, now)?;
            }
            let reason = output.as_deref().unwrap_or("Marked failed");
            // Manual failure is final.
            tx.execute(
                "UPDATE stories SET status = 'failed', error = ?1, retry_count = max_retries,
                   updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![reason, now.timestamp_millis(), story.id],
            )?;
            sync_loop_step(tx, &run.id, &loop_step, now)?;
        }
        Some(StoryStatus::Pending) if story.status == StoryStatus::Failed => {
            tx.execute(
                "UPDATE stories SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                   updated_at = ?1
                 WHERE id = ?2",
                rusqlite::params![now.timestamp_millis(), story.id],
            )?;
            sync_loop_step(tx, &run.id, &loop_step, now)?;
        }
        Some(status @ (StoryStatus::Completed | StoryStatus::Failed | StoryStatus::Pending)) => {
            return Err(ServerError::invalid_state(
                format!("Story {} cannot be set to {}", story.story_id, status),
                story.status.as_str(),
            ));
        }
        Some(other) => {
            return Err(ServerError::BadRequest(format!(
                "Cannot set story status to {}; use start or complete",
                other
            )));
        }
    }

    load_story(tx, &story.id)?.ok_or_else(|| ServerError::NotFound("Story not found".to_string()))
}
