use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A reusable pipeline template: an ordered list of step definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stage of a workflow template. Copied into a run as a [`Step`](super::Step).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub step_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub input_template: String,
    #[serde(default)]
    pub expects: String,
    #[serde(default)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub position: u32,
}

/// How a step completes. Only loop steps carry loop configuration and only
/// approval steps carry approval configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Single,
    Loop(LoopConfig),
    Approval(ApprovalConfig),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Loop(_) => "loop",
            Self::Approval(_) => "approval",
        }
    }

    pub fn loop_config(&self) -> Option<&LoopConfig> {
        match self {
            Self::Loop(cfg) => Some(cfg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// What the loop iterates over. Only `stories` is supported.
    #[serde(default = "default_loop_over")]
    pub over: String,
    #[serde(default)]
    pub completion: CompletionPolicy,
    #[serde(default)]
    pub verify_each: bool,
    /// `step_id` of the step that verifies each story.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_story_retries: Option<u32>,
}

fn default_loop_over() -> String {
    "stories".to_string()
}

/// When a loop step is done. Unknown policy names fail deserialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Every story has reached a terminal state.
    #[default]
    AllDone,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    /// Shown to whoever approves the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Input for creating a new workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowInput {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl CreateWorkflowInput {
    /// Check the definition before it is stored.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Workflow name is required".to_string());
        }
        if self.steps.is_empty() {
            return Err("Workflow must have at least one step".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err("Every step needs a stepId".to_string());
            }
            if step.agent_id.trim().is_empty() {
                return Err(format!("Step '{}' needs an agentId", step.step_id));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(format!("Duplicate stepId '{}'", step.step_id));
            }
        }

        for step in &self.steps {
            if let StepKind::Loop(cfg) = &step.kind {
                if cfg.over != "stories" {
                    return Err(format!(
                        "Step '{}': unsupported loop source '{}'",
                        step.step_id, cfg.over
                    ));
                }
                match &cfg.verify_step {
                    Some(verify) if verify == &step.step_id => {
                        return Err(format!("Step '{}' cannot verify itself", step.step_id));
                    }
                    Some(verify) if !seen.contains(verify.as_str()) => {
                        return Err(format!(
                            "Step '{}': verify step '{}' does not exist",
                            step.step_id, verify
                        ));
                    }
                    Some(_) if !cfg.verify_each => {
                        return Err(format!(
                            "Step '{}': verifyStep requires verifyEach",
                            step.step_id
                        ));
                    }
                    None if cfg.verify_each => {
                        return Err(format!(
                            "Step '{}': verifyEach requires a verifyStep",
                            step.step_id
                        ));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Step definitions in pipeline order (by `position`, then declaration order).
    pub fn ordered_steps(&self) -> Vec<StepDefinition> {
        let mut steps: Vec<(usize, StepDefinition)> =
            self.steps.iter().cloned().enumerate().collect();
        steps.sort_by_key(|(i, s)| (s.position, *i));
        steps
            .into_iter()
            .enumerate()
            .map(|(i, (_, mut s))| {
                s.position = i as u32;
                s
            })
            .collect()
    }
}
