//! Workflow engine: runs, steps and stories driven by polling agents.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► WorkflowStore (catalog)
//!                                              │
//!                              POST /runs ──► WorkflowEngine::create_run
//!                                              │
//!        agent ── claim ──► claim.rs ──► resolve_template(input, context)
//!        agent ── complete/fail ──► advance.rs ──► merge_context_from_output
//!                                              │      parse_structured_stories
//!                                              ▼
//!                                   next step pending / run completed
//! ```
//!
//! Every state transition runs inside one `BEGIN IMMEDIATE` transaction.
//! Claims are conditional updates; the affected-row count decides the winner.

pub mod advance;
pub mod claim;
pub mod orchestrator;
pub mod output;
pub mod schema;
pub mod template;

#[cfg(test)]
mod tests;

pub use advance::{CompletionOutcome, FailureOutcome};
pub use claim::{ClaimedStep, ClaimedStory};
pub use orchestrator::WorkflowEngine;
pub use output::{merge_context_from_output, parse_structured_stories, OutputError};
pub use schema::WorkflowDefinition;
pub use template::resolve_template;

/// Engine-wide defaults applied when a run is created.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry budget for steps (and their stories) that do not set their own.
    pub default_max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 2,
        }
    }
}
