use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::step::UnitOutput;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoryStatus {
    Pending,
    Running,
    Verifying,
    Completed,
    Failed,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "verifying" => Some(Self::Verifying),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One iteration unit inside a loop step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub step_id: String,
    pub run_id: String,
    pub story_index: u32,
    pub story_id: String,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub status: StoryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Story {
    /// Human-readable block handed to agents through `{{current_story}}`.
    pub fn render(&self) -> String {
        let mut out = format!("Story {}: {}", self.story_id, self.title);
        if !self.description.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.description);
        }
        if !self.acceptance_criteria.is_empty() {
            out.push_str("\n\nAcceptance Criteria:");
            for (i, criterion) in self.acceptance_criteria.iter().enumerate() {
                out.push_str(&format!("\n{}. {}", i + 1, criterion));
            }
        }
        out
    }
}

/// A story as emitted by an agent, before it is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorySeed {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "acceptance_criteria")]
    pub acceptance_criteria: Vec<String>,
}

/// Partial update for manual story transitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStoryInput {
    pub status: Option<StoryStatus>,
    pub output: Option<UnitOutput>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_accepts_both_criteria_spellings() {
        let camel: StorySeed = serde_json::from_value(serde_json::json!({
            "id": "S1", "title": "Login", "acceptanceCriteria": ["works"]
        }))
        .unwrap();
        let snake: StorySeed = serde_json::from_value(serde_json::json!({
            "id": "S1", "title": "Login", "acceptance_criteria": ["works"]
        }))
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.description, "");
    }

    #[test]
    fn render_lists_acceptance_criteria_one_per_line() {
        let now = Utc::now();
        let story = Story {
            id: "s".into(),
            step_id: "step".into(),
            run_id: "run".into(),
            story_index: 0,
            story_id: "S1".into(),
            title: "Login page".into(),
            description: "Add a login page".into(),
            acceptance_criteria: vec!["Form renders".into(), "Errors shown".into()],
            status: StoryStatus::Pending,
            output: None,
            error: None,
            retry_count: 0,
            max_retries: 2,
            claimed_by: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(
            story.render(),
            "Story S1: Login page\n\nAdd a login page\n\nAcceptance Criteria:\n1. Form renders\n2. Errors shown"
        );
    }
}
