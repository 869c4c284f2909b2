//! Run orchestration: creating runs from catalog workflows and the read/write
//! operations the HTTP layer exposes for runs, steps and stories.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

use super::advance::advance_pipeline;
use super::output::MAX_STORIES;
use super::EngineConfig;
use crate::db::Database;
use crate::error::ServerError;
use crate::models::run::{CreateRunInput, Run, RunContext, RunFilter, RunStatus};
use crate::models::step::{Step, StepStatus};
use crate::models::story::{Story, StorySeed};
use crate::models::workflow::StepKind;
use crate::store::run_store::{insert_run, load_run, set_run_status};
use crate::store::step_store::{find_run_step, insert_step, list_steps};
use crate::store::story_store::{find_run_story, insert_stories, list_stories};
use crate::store::workflow_store::load_workflow;
use crate::store::RunStore;

/// Entry point for every run, step and story operation.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) db: Database,
    pub(crate) config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(db: Database, config: EngineConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ─── Runs ──────────────────────────────────────────────────────────

    /// Create a run of a catalog workflow.
    ///
    /// All steps are created `waiting`. With `start` the run goes straight to
    /// `running` and its first step becomes `pending`.
    pub async fn create_run(&self, input: CreateRunInput) -> Result<Run, ServerError> {
        let default_max_retries = self.config.default_max_retries;
        let run = self
            .db
            .transaction(move |tx| create_run_tx(tx, input, default_max_retries, Utc::now()))
            .await?;
        tracing::info!(
            "Created run {} of workflow {} for task {} ({})",
            run.id,
            run.workflow_id,
            run.task_id,
            run.status
        );
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, ServerError> {
        RunStore::new(self.db.clone())
            .get(run_id)
            .await?
            .ok_or_else(|| ServerError::NotFound("Run not found".to_string()))
    }

    pub async fn list_runs(&self, filter: RunFilter) -> Result<Vec<Run>, ServerError> {
        RunStore::new(self.db.clone()).list(filter).await
    }

    /// Direct status override.
    ///
    /// Setting `running` (re)activates the pipeline when no step is active.
    /// Cancelling does not touch in-flight steps; the sweepers ignore runs
    /// that are not `running`.
    pub async fn update_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
    ) -> Result<Run, ServerError> {
        let run_id = run_id.to_string();
        let run = self
            .db
            .transaction(move |tx| update_run_status_tx(tx, &run_id, status, Utc::now()))
            .await?;
        tracing::info!("Run {} status set to {}", run.id, run.status);
        Ok(run)
    }

    // ─── Steps ─────────────────────────────────────────────────────────

    pub async fn list_steps(&self, run_id: &str) -> Result<Vec<Step>, ServerError> {
        let run_id = run_id.to_string();
        self.db
            .transaction(move |tx| {
                require_run(tx, &run_id)?;
                Ok(list_steps(tx, &run_id)?)
            })
            .await
    }

    pub async fn pending_steps(&self, run_id: &str) -> Result<Vec<Step>, ServerError> {
        Ok(self
            .list_steps(run_id)
            .await?
            .into_iter()
            .filter(|s| s.status == StepStatus::Pending)
            .collect())
    }

    pub async fn get_step(&self, run_id: &str, step_key: &str) -> Result<Step, ServerError> {
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        self.db
            .transaction(move |tx| {
                require_run(tx, &run_id)?;
                require_step(tx, &run_id, &step_key)
            })
            .await
    }

    // ─── Stories ───────────────────────────────────────────────────────

    pub async fn list_run_stories(&self, run_id: &str) -> Result<Vec<Story>, ServerError> {
        let run_id = run_id.to_string();
        self.db
            .transaction(move |tx| {
                require_run(tx, &run_id)?;
                let mut stories = Vec::new();
                for step in list_steps(tx, &run_id)?.iter().filter(|s| s.is_loop()) {
                    stories.extend(list_stories(tx, &step.id)?);
                }
                Ok(stories)
            })
            .await
    }

    pub async fn list_step_stories(
        &self,
        run_id: &str,
        step_key: &str,
    ) -> Result<Vec<Story>, ServerError> {
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        self.db
            .transaction(move |tx| {
                require_run(tx, &run_id)?;
                let step = require_step(tx, &run_id, &step_key)?;
                Ok(list_stories(tx, &step.id)?)
            })
            .await
    }

    pub async fn get_story(&self, run_id: &str, story_key: &str) -> Result<Story, ServerError> {
        let run_id = run_id.to_string();
        let story_key = story_key.to_string();
        self.db
            .transaction(move |tx| {
                require_run(tx, &run_id)?;
                require_story(tx, &run_id, &story_key)
            })
            .await
    }

    /// Append stories to a loop step that has not finished yet.
    pub async fn add_stories(
        &self,
        run_id: &str,
        step_key: &str,
        seeds: Vec<StorySeed>,
    ) -> Result<Vec<Story>, ServerError> {
        validate_seeds(&seeds)?;
        let run_id = run_id.to_string();
        let step_key = step_key.to_string();
        let created = self
            .db
            .transaction(move |tx| {
                require_run(tx, &run_id)?;
                let step = require_step(tx, &run_id, &step_key)?;
                let StepKind::Loop(cfg) = &step.kind else {
                    return Err(ServerError::BadRequest(format!(
                        "Step {} is not a loop step",
                        step.step_id
                    )));
                };
                if matches!(step.status, StepStatus::Completed | StepStatus::Failed) {
                    return Err(ServerError::invalid_state(
                        format!("Step {} no longer accepts stories", step.step_id),
                        step.status.as_str(),
                    ));
                }
                let max_retries = cfg.max_story_retries.unwrap_or(step.max_retries);
                Ok(insert_stories(tx, &step, &seeds, max_retries, Utc::now())?)
            })
            .await?;
        tracing::info!("Added {} stories", created.len());
        Ok(created)
    }
}

// ─── Transaction bodies ────────────────────────────────────────────────

fn create_run_tx(
    tx: &Connection,
    input: CreateRunInput,
    default_max_retries: u32,
    now: DateTime<Utc>,
) -> Result<Run, ServerError> {
    let workflow = load_workflow(tx, &input.workflow_id)?
        .ok_or_else(|| ServerError::NotFound("Workflow not found".to_string()))?;

    let run_id = Uuid::new_v4().to_string();
    let mut context: RunContext = input
        .context
        .into_iter()
        .map(|(k, v)| (k.to_lowercase(), v))
        .collect();
    context.insert("task_id".to_string(), input.task_id.clone());
    context.insert("run_id".to_string(), run_id.clone());

    let run = Run {
        id: run_id,
        workflow_id: workflow.id.clone(),
        task_id: input.task_id,
        status: RunStatus::Pending,
        context,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
    };
    insert_run(tx, &run)?;

    for (index, def) in workflow.steps.iter().enumerate() {
        let step = Step {
            id: Uuid::new_v4().to_string(),
            run_id: run.id.clone(),
            step_index: index as u32,
            step_id: def.step_id.clone(),
            agent_id: def.agent_id.clone(),
            input_template: def.input_template.clone(),
            expects: def.expects.clone(),
            kind: def.kind.clone(),
            status: StepStatus::Waiting,
            output: None,
            error: None,
            retry_count: 0,
            max_retries: def.max_retries.unwrap_or(default_max_retries),
            current_story_id: None,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        };
        insert_step(tx, &step)?;
    }

    if input.start {
        set_run_status(tx, &run.id, RunStatus::Running, now)?;
        advance_pipeline(tx, &run.id, now)?;
    }
    require_run(tx, &run.id)
}

fn update_run_status_tx(
    tx: &Connection,
    run_id: &str,
    status: RunStatus,
    now: DateTime<Utc>,
) -> Result<Run, ServerError> {
    let run = require_run(tx, run_id)?;
    if run.status == status {
        return Ok(run);
    }
    match status {
        RunStatus::Pending => {
            return Err(ServerError::invalid_state(
                "A started run cannot return to pending",
                run.status.as_str(),
            ));
        }
        RunStatus::Running => {
            set_run_status(tx, run_id, status, now)?;
            let active = list_steps(tx, run_id)?.iter().any(|s| {
                matches!(
                    s.status,
                    StepStatus::Pending | StepStatus::Running | StepStatus::AwaitingApproval
                )
            });
            if !active {
                advance_pipeline(tx, run_id, now)?;
            }
        }
        _ => {
            set_run_status(tx, run_id, status, now)?;
        }
    }
    require_run(tx, run_id)
}

fn validate_seeds(seeds: &[StorySeed]) -> Result<(), ServerError> {
    if seeds.is_empty() {
        return Err(ServerError::BadRequest("stories must not be empty".to_string()));
    }
    if seeds.len() > MAX_STORIES {
        return Err(ServerError::BadRequest(format!(
            "at most {} stories may be added at once",
            MAX_STORIES
        )));
    }
    for seed in seeds {
        if seed.id.trim().is_empty() {
            return Err(ServerError::BadRequest("story id is required".to_string()));
        }
        if seed.title.trim().is_empty() {
            return Err(ServerError::BadRequest(format!(
                "story {}: title is required",
                seed.id
            )));
        }
    }
    Ok(())
}

// ─── Lookups shared by the engine modules ──────────────────────────────

pub(crate) fn require_run(conn: &Connection, run_id: &str) -> Result<Run, ServerError> {
    load_run(conn, run_id)?.ok_or_else(|| ServerError::NotFound("Run not found".to_string()))
}

pub(crate) fn require_step(
    conn: &Connection,
    run_id: &str,
    step_key: &str,
) -> Result<Step, ServerError> {
    find_run_step(conn, run_id, step_key)?
        .ok_or_else(|| ServerError::NotFound("Step not found".to_string()))
}

pub(crate) fn require_story(
    conn: &Connection,
    run_id: &str,
    story_key: &str,
) -> Result<Story, ServerError> {
    find_run_story(conn, run_id, story_key)?
        .ok_or_else(|| ServerError::NotFound("Story not found".to_string()))
}
