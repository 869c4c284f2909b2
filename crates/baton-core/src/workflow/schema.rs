//! YAML file format for workflow definitions.
//!
//! A workflow YAML is the authoring form of a [`CreateWorkflowInput`]:
//!
//! ```yaml
//! name: "feature-dev"
//! description: "Plan, implement story by story, verify, ship"
//!
//! steps:
//!   - id: plan
//!     agent: planner
//!     input: |
//!       Plan the work for {{task}}.
//!       Reply with STATUS: done and STORIES_JSON: [...]
//!     expects: "STATUS: done"
//!
//!   - id: implement
//!     agent: developer
//!     type: loop
//!     input: "Implement {{current_story}}"
//!     loop:
//!       over: stories
//!       completion: all_done
//!       verify_each: true
//!       verify_step: verify
//!
//!   - id: verify
//!     agent: reviewer
//!     input: "Check {{current_story_title}}. Reply STATUS: done or STATUS: retry"
//!
//!   - id: release
//!     agent: release-manager
//!     type: approval
//!     instructions: "Confirm the changelog before shipping"
//! ```

use serde::{Deserialize, Serialize};

use crate::models::workflow::{
    ApprovalConfig, CompletionPolicy, CreateWorkflowInput, LoopConfig, StepDefinition, StepKind,
};

/// Top-level workflow definition loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Ordered list of steps; file order is pipeline order.
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[default]
    Single,
    Loop,
    Approval,
}

/// A single step as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step key, unique within the workflow.
    pub id: String,

    /// Agent that is allowed to claim this step.
    pub agent: String,

    #[serde(rename = "type", default)]
    pub step_type: StepType,

    /// Input template with `{{name}}` placeholders.
    #[serde(default)]
    pub input: String,

    /// Free-text description of the expected output.
    #[serde(default)]
    pub expects: String,

    #[serde(default, rename = "loop")]
    pub loop_config: Option<LoopSection>,

    /// Approval instructions (approval steps only).
    #[serde(default)]
    pub instructions: Option<String>,

    #[serde(default)]
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSection {
    #[serde(default = "default_over")]
    pub over: String,
    #[serde(default)]
    pub completion: CompletionPolicy,
    #[serde(default)]
    pub verify_each: bool,
    #[serde(default)]
    pub verify_step: Option<String>,
    #[serde(default)]
    pub max_story_retries: Option<u32>,
}

fn default_over() -> String {
    "stories".to_string()
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse workflow YAML: {}", e))
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read workflow file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    /// Convert into the catalog input, checking it the same way the API does.
    pub fn into_input(self) -> Result<CreateWorkflowInput, String> {
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(position, step)| step.into_definition(position as u32))
            .collect::<Result<Vec<_>, _>>()?;
        let input = CreateWorkflowInput {
            name: self.name,
            description: self.description,
            steps,
        };
        input.validate()?;
        Ok(input)
    }
}

impl WorkflowStep {
    fn into_definition(self, position: u32) -> Result<StepDefinition, String> {
        if self.step_type != StepType::Loop && self.loop_config.is_some() {
            return Err(format!("Step '{}': `loop` is only valid on loop steps", self.id));
        }
        let kind = match self.step_type {
            StepType::Single => StepKind::Single,
            StepType::Approval => StepKind::Approval(ApprovalConfig {
                instructions: self.instructions,
            }),
            StepType::Loop => {
                let section = self.loop_config.unwrap_or(LoopSection {
                    over: default_over(),
                    completion: CompletionPolicy::AllDone,
                    verify_each: false,
                    verify_step: None,
                    max_story_retries: None,
                });
                StepKind::Loop(LoopConfig {
                    over: section.over,
                    completion: section.completion,
                    verify_each: section.verify_each,
                    verify_step: section.verify_step,
                    max_story_retries: section.max_story_retries,
                })
            }
        };
        Ok(StepDefinition {
            step_id: self.id,
            agent_id: self.agent,
            input_template: self.input,
            expects: self.expects,
            kind,
            max_retries: self.max_retries,
            position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
name: "Test Flow"
steps:
  - id: build
    agent: developer
    input: "Build {{task}}"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "Test Flow");
        assert_eq!(wf.steps.len(), 1);
        assert_eq!(wf.steps[0].step_type, StepType::Single);

        let input = wf.into_input().unwrap();
        assert_eq!(input.steps[0].step_id, "build");
        assert_eq!(input.steps[0].kind, StepKind::Single);
    }

    #[test]
    fn test_parse_full_workflow() {
        let yaml = r#"
name: "feature-dev"
description: "Plan then implement"
steps:
  - id: plan
    agent: planner
    input: "Plan {{task}}"
    expects: "STATUS: done"
  - id: implement
    agent: developer
    type: loop
    max_retries: 3
    loop:
      verify_each: true
      verify_step: verify
      max_story_retries: 1
  - id: verify
    agent: reviewer
  - id: ship
    agent: release
    type: approval
    instructions: "Check the changelog"
"#;
        let input = WorkflowDefinition::from_yaml(yaml).unwrap().into_input().unwrap();
        assert_eq!(input.steps.len(), 4);
        assert_eq!(input.steps[2].position, 2);

        let cfg = input.steps[1].kind.loop_config().unwrap();
        assert_eq!(cfg.over, "stories");
        assert_eq!(cfg.completion, CompletionPolicy::AllDone);
        assert!(cfg.verify_each);
        assert_eq!(cfg.verify_step.as_deref(), Some("verify"));
        assert_eq!(input.steps[1].max_retries, Some(3));

        assert_eq!(
            input.steps[3].kind,
            StepKind::Approval(ApprovalConfig {
                instructions: Some("Check the changelog".to_string())
            })
        );
    }

    #[test]
    fn unknown_completion_policy_is_rejected() {
        let yaml = r#"
name: "bad"
steps:
  - id: implement
    agent: developer
    type: loop
    loop:
      completion: first_done
"#;
        assert!(WorkflowDefinition::from_yaml(yaml).is_err());
    }

    #[test]
    fn verify_step_must_exist() {
        let yaml = r#"
name: "bad"
steps:
  - id: implement
    agent: developer
    type: loop
    loop:
      verify_each: true
      verify_step: nowhere
"#;
        let err = WorkflowDefinition::from_yaml(yaml).unwrap().into_input().unwrap_err();
        assert!(err.contains("nowhere"), "{}", err);
    }
}
