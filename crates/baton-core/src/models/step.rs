use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::workflow::StepKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Pending,
    Running,
    Completed,
    Failed,
    AwaitingApproval,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingApproval => "awaiting_approval",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(Self::Waiting),
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "awaiting_approval" => Some(Self::AwaitingApproval),
            _ => None,
        }
    }

    /// States a step can be explicitly claimed from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Waiting | Self::Pending)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage of a run's pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub run_id: String,
    pub step_index: u32,
    pub step_id: String,
    pub agent_id: String,
    pub input_template: String,
    pub expects: String,
    pub kind: StepKind,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_story_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Step {
    pub fn is_loop(&self) -> bool {
        matches!(self.kind, StepKind::Loop(_))
    }
}

/// Raw agent output: free text, or a structured JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UnitOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl UnitOutput {
    /// Text form used for storage and output interpretation. Objects are
    /// serialized; plain text is kept verbatim.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Structured(serde_json::Value::String(s)) => s.clone(),
            Self::Structured(v) => v.to_string(),
        }
    }
}

impl From<&str> for UnitOutput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Partial update for approval and manual transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStepInput {
    pub status: Option<StepStatus>,
    pub output: Option<UnitOutput>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_are_snake_case() {
        assert_eq!(StepStatus::AwaitingApproval.as_str(), "awaiting_approval");
        assert_eq!(
            serde_json::to_value(StepStatus::AwaitingApproval).unwrap(),
            serde_json::json!("awaiting_approval")
        );
        assert_eq!(StepStatus::from_str("awaiting_approval"), Some(StepStatus::AwaitingApproval));
        assert_eq!(StepStatus::from_str("done"), None);
    }

    #[test]
    fn structured_output_is_serialized() {
        let output: UnitOutput = serde_json::from_value(serde_json::json!({ "ok": true })).unwrap();
        assert_eq!(output.to_text(), r#"{"ok":true}"#);

        let output: UnitOutput = serde_json::from_value(serde_json::json!("STATUS: done")).unwrap();
        assert_eq!(output.to_text(), "STATUS: done");
    }
}
