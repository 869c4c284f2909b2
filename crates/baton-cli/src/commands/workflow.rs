//! `baton workflow`: Install and inspect YAML workflow definitions.

use baton_core::models::workflow::Workflow;
use baton_core::workflow::WorkflowDefinition;
use baton_core::AppState;

use super::print_json;

/// Load a workflow YAML file and add it to the catalog.
pub async fn install(state: &AppState, workflow_file: &str) -> Result<Workflow, String> {
    let definition = WorkflowDefinition::from_file(workflow_file)?;
    let input = definition.into_input()?;
    let workflow = state
        .workflow_store
        .create(input)
        .await
        .map_err(|e| e.to_string())?;

    println!(
        "Installed workflow: {} ({}), {} step(s)",
        workflow.name,
        workflow.id,
        workflow.steps.len()
    );
    Ok(workflow)
}

/// Parse and validate a workflow YAML file without storing it.
pub async fn validate(workflow_file: &str) -> Result<(), String> {
    let definition = WorkflowDefinition::from_file(workflow_file)?;
    let name = definition.name.clone();
    let input = definition.into_input()?;
    println!("Workflow '{}' is valid ({} step(s))", name, input.steps.len());
    for step in &input.steps {
        println!("  {:>2}. {} [{}] -> {}", step.position + 1, step.step_id, step.kind.name(), step.agent_id);
    }
    Ok(())
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let workflows = state
        .workflow_store
        .list()
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "workflows": workflows }));
    Ok(())
}
