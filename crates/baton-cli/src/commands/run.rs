//! `baton run`: Create, list and inspect workflow runs.

use console::style;

use baton_core::models::{CreateRunInput, Run, RunContext, RunFilter, RunStatus, StepStatus};
use baton_core::AppState;

use super::print_json;

/// Parse `KEY=VALUE` pairs into a seed context.
pub fn parse_context(pairs: &[String]) -> Result<RunContext, String> {
    let mut context = RunContext::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Invalid context entry '{}', expected KEY=VALUE", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid context entry '{}', key is empty", pair));
        }
        context.insert(key.to_lowercase(), value.to_string());
    }
    Ok(context)
}

pub async fn create(
    state: &AppState,
    workflow_id: &str,
    task_id: &str,
    context: &[String],
    start: bool,
) -> Result<Run, String> {
    let run = state
        .engine
        .create_run(CreateRunInput {
            workflow_id: workflow_id.to_string(),
            task_id: task_id.to_string(),
            context: parse_context(context)?,
            start,
        })
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "Created run {} for task {} ({})",
        style(&run.id).bold(),
        run.task_id,
        run.status
    );
    Ok(run)
}

pub async fn list(
    state: &AppState,
    status: Option<&str>,
    task_id: Option<&str>,
) -> Result<(), String> {
    let status = status
        .map(|s| RunStatus::from_str(s).ok_or_else(|| format!("Invalid status: {}", s)))
        .transpose()?;
    let runs = state
        .engine
        .list_runs(RunFilter {
            status,
            task_id: task_id.map(str::to_string),
            workflow_id: None,
        })
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "runs": runs }));
    Ok(())
}

/// Print a run with its steps and stories.
pub async fn show(state: &AppState, run_id: &str) -> Result<(), String> {
    let run = state.engine.get_run(run_id).await.map_err(|e| e.to_string())?;
    let steps = state
        .engine
        .list_steps(run_id)
        .await
        .map_err(|e| e.to_string())?;
    let stories = state
        .engine
        .list_run_stories(run_id)
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "{} {}  task={}  status={}",
        style("Run").bold(),
        run.id,
        run.task_id,
        status_style(run.status.as_str())
    );
    println!();
    println!("{}", style("Steps").bold());
    for step in &steps {
        let mut line = format!(
            "  {:>2}. {:<16} {:<9} {:<18} agent={}",
            step.step_index + 1,
            step.step_id,
            step.kind.name(),
            status_style(step.status.as_str()),
            step.agent_id
        );
        if step.retry_count > 0 {
            line.push_str(&format!("  retries={}/{}", step.retry_count, step.max_retries));
        }
        if step.status == StepStatus::Failed {
            if let Some(error) = &step.error {
                line.push_str(&format!("  error={}", error));
            }
        }
        println!("{}", line);
    }

    if !stories.is_empty() {
        println!();
        println!("{}", style("Stories").bold());
        for story in &stories {
            println!(
                "  {:>2}. {:<16} {:<12} {}",
                story.story_index + 1,
                story.story_id,
                status_style(story.status.as_str()),
                story.title
            );
        }
    }

    if !run.context.is_empty() {
        println!();
        println!("{}", style("Context").bold());
        for (key, value) in &run.context {
            let first_line = value.lines().next().unwrap_or_default();
            println!("  {} = {}", key, first_line);
        }
    }
    Ok(())
}

fn status_style(status: &str) -> console::StyledObject<&str> {
    match status {
        "completed" | "done" => style(status).green(),
        "failed" | "cancelled" => style(status).red(),
        "running" | "awaiting_approval" => style(status).yellow(),
        _ => style(status).dim(),
    }
}
