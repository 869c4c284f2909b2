use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Accumulated key/value data threaded between steps. Keys are lowercase.
pub type RunContext = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a workflow bound to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub workflow_id: String,
    pub task_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub context: RunContext,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `POST /runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunInput {
    pub workflow_id: String,
    #[serde(deserialize_with = "super::string_or_number")]
    pub task_id: String,
    /// Seed context; keys are lowercased on the way in.
    #[serde(default, alias = "seedContext")]
    pub context: RunContext,
    /// Start immediately (first step pending). When false the run stays
    /// `pending` until its status is set to `running`.
    #[serde(default = "default_true")]
    pub start: bool,
}

fn default_true() -> bool {
    true
}

/// Filters for listing runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub task_id: Option<String>,
    pub workflow_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::from_str("paused"), None);
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn create_input_defaults_to_started() {
        let input: CreateRunInput = serde_json::from_value(serde_json::json!({
            "workflowId": "wf",
            "taskId": 42,
            "seedContext": { "repo": "/x" }
        }))
        .unwrap();
        assert!(input.start);
        assert_eq!(input.task_id, "42");
        assert_eq!(input.context.get("repo").map(String::as_str), Some("/x"));
    }
}
