use std::collections::HashSet;

use super::*;
use crate::db::Database;
use crate::error::ServerError;
use crate::models::run::{CreateRunInput, RunContext, RunStatus};
use crate::models::step::{StepStatus, UnitOutput, UpdateStepInput};
use crate::models::story::{StorySeed, StoryStatus, UpdateStoryInput};
use crate::models::workflow::{
    ApprovalConfig, CompletionPolicy, CreateWorkflowInput, LoopConfig, StepDefinition, StepKind,
};
use crate::store::{StepStore, StoryStore, WorkflowStore};

fn step(id: &str, agent: &str, input: &str, kind: StepKind) -> StepDefinition {
    StepDefinition {
        step_id: id.to_string(),
        agent_id: agent.to_string(),
        input_template: input.to_string(),
        expects: "STATUS: done".to_string(),
        kind,
        max_retries: None,
        position: 0,
    }
}

fn story_loop(verify: Option<&str>, max_story_retries: Option<u32>) -> StepKind {
    StepKind::Loop(LoopConfig {
        over: "stories".to_string(),
        completion: CompletionPolicy::AllDone,
        verify_each: verify.is_some(),
        verify_step: verify.map(str::to_string),
        max_story_retries,
    })
}

async fn setup(steps: Vec<StepDefinition>) -> (WorkflowEngine, String) {
    let db = Database::open_in_memory().unwrap();
    let wf = WorkflowStore::new(db.clone())
        .create(CreateWorkflowInput {
            name: "test-flow".to_string(),
            description: None,
            steps,
        })
        .await
        .unwrap();
    (WorkflowEngine::new(db, EngineConfig::default()), wf.id)
}

async fn start_run(engine: &WorkflowEngine, workflow_id: &str, context: &[(&str, &str)]) -> String {
    let context: RunContext = context
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    engine
        .create_run(CreateRunInput {
            workflow_id: workflow_id.to_string(),
            task_id: "42".to_string(),
            context,
            start: true,
        })
        .await
        .unwrap()
        .id
}

fn text(s: &str) -> UnitOutput {
    UnitOutput::Text(s.to_string())
}

#[tokio::test]
async fn two_step_pipeline_threads_context() {
    let (engine, wf) = setup(vec![
        step("plan", "planner", "Plan {{Feature}}", StepKind::Single),
        step("build", "dev", "Build using {{summary}} for run {{run_id}}", StepKind::Single),
    ])
    .await;
    let run_id = start_run(&engine, &wf, &[("FEATURE", "login")]).await;

    let run = engine.get_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.context.get("feature").map(String::as_str), Some("login"));
    assert_eq!(run.context.get("task_id").map(String::as_str), Some("42"));

    let pending = engine.pending_steps(&run_id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].step_id, "plan");

    // Wrong agent sees nothing.
    assert!(engine.claim_next_step("dev", None).await.unwrap().is_none());

    let claimed = engine.claim_next_step("planner", None).await.unwrap().unwrap();
    assert_eq!(claimed.resolved_input, "Plan login");
    assert_eq!(claimed.step.status, StepStatus::Running);

    let outcome = engine
        .complete_step(&run_id, "plan", text("STATUS: done\nSUMMARY: two screens"))
        .await
        .unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.step_status, StepStatus::Completed);
    assert!(!outcome.run_completed);

    let claimed = engine.claim_step(&run_id, "build", "dev").await.unwrap();
    assert_eq!(
        claimed.resolved_input,
        format!("Build using two screens for run {}", run_id)
    );

    let outcome = engine
        .complete_step(&run_id, &claimed.step.id, text("STATUS: done"))
        .await
        .unwrap();
    assert!(outcome.run_completed);
    assert_eq!(outcome.run_status, RunStatus::Completed);

    let run = engine.get_run(&run_id).await.unwrap();
    assert!(run.completed_at.is_some());
    assert_eq!(run.context.get("summary").map(String::as_str), Some("two screens"));
}

#[tokio::test]
async fn unknown_placeholders_are_marked_missing() {
    let (engine, wf) = setup(vec![step("only", "dev", "Use {{nothing}}", StepKind::Single)]).await;
    let run_id = start_run(&engine, &wf, &[]).await;
    let claimed = engine.claim_step(&run_id, "only", "dev").await.unwrap();
    assert_eq!(claimed.resolved_input, "Use [missing: nothing]");
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let (engine, wf) = setup(vec![step("build", "dev", "go", StepKind::Single)]).await;
    let run_id = start_run(&engine, &wf, &[]).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.claim_next_step("dev", None).await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let err = engine.claim_step(&run_id, "build", "dev").await.unwrap_err();
    assert!(matches!(err, ServerError::NotClaimable { .. }));
}

#[tokio::test]
async fn explicit_claim_checks_agent_and_run_state() {
    let (engine, wf) = setup(vec![step("build", "dev", "go", StepKind::Single)]).await;
    let run_id = start_run(&engine, &wf, &[]).await;

    let err = engine.claim_step(&run_id, "build", "ops").await.unwrap_err();
    assert!(matches!(err, ServerError::Forbidden(_)));
    let err = engine.claim_step(&run_id, "missing", "dev").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));

    engine
        .update_run_status(&run_id, RunStatus::Cancelled)
        .await
        .unwrap();
    let err = engine.claim_step(&run_id, "build", "dev").await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidState { .. }));
    assert!(engine.claim_next_step("dev", None).await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_stories_roll_back_completion() {
    let (engine, wf) = setup(vec![
        step("plan", "planner", "plan", StepKind::Single),
        step("implement", "dev", "{{current_story}}", story_loop(None, None)),
    ])
    .await;
    let run_id = start_run(&engine, &wf, &[]).await;
    engine.claim_step(&run_id, "plan", "planner").await.unwrap();

    let err = engine
        .complete_step(
            &run_id,
            "plan",
            text("STATUS: done\nREPO: /tmp/x\nSTORIES_JSON: [{\"id\": \"S1\""),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::MalformedPayload(_)));

    let plan = engine.get_step(&run_id, "plan").await.unwrap();
    assert_eq!(plan.status, StepStatus::Running);
    let run = engine.get_run(&run_id).await.unwrap();
    assert!(!run.context.contains_key("repo"));
    assert!(engine.list_run_stories(&run_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn loop_with_verification_retries_a_rejected_story() {
    let (engine, wf) = setup(vec![
        step("plan", "planner", "plan", StepKind::Single),
        step(
            "implement",
            "dev",
            "Do {{current_story_id}}. Feedback: {{verify_feedback}}",
            story_loop(Some("verify"), Some(2)),
        ),
        step("verify", "reviewer", "Check {{current_story_title}}", StepKind::Single),
    ])
    .await;
    let run_id = start_run(&engine, &wf, &[]).await;

    engine.claim_next_step("planner", None).await.unwrap().unwrap();
    let outcome = engine
        .complete_step(
            &run_id,
            "plan",
            text(
                "STATUS: done\nSTORIES_JSON: [{\"id\":\"S1\",\"title\":\"Login form\"},{\"id\":\"S2\",\"title\":\"Logout\"}]",
            ),
        )
        .await
        .unwrap();
    assert_eq!(outcome.stories_added, 2);

    let implement = engine.get_step(&run_id, "implement").await.unwrap();
    assert_eq!(implement.status, StepStatus::Pending);

    // First story, first attempt.
    let claimed = engine.claim_next_step("dev", None).await.unwrap().unwrap();
    let story = claimed.story.clone().unwrap();
    assert_eq!(story.story_id, "S1");
    assert_eq!(claimed.resolved_input, "Do S1. Feedback: ");
    assert_eq!(claimed.step.current_story_id.as_deref(), Some(story.id.as_str()));

    // One story in flight per loop step.
    assert!(engine.claim_story(&run_id, "implement", None).await.unwrap().is_none());

    let outcome = engine
        .complete_step(&run_id, "implement", text("STATUS: done"))
        .await
        .unwrap();
    assert_eq!(outcome.story_status, Some(StoryStatus::Verifying));
    assert!(!outcome.completed);

    let review = engine.claim_next_step("reviewer", None).await.unwrap().unwrap();
    assert_eq!(review.story.as_ref().map(|s| s.story_id.as_str()), Some("S1"));
    assert_eq!(review.resolved_input, "Check Login form");

    let outcome = engine
        .complete_step(
            &run_id,
            "verify",
            text("STATUS: retry\nFEEDBACK: missing validation"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.story_status, Some(StoryStatus::Pending));
    assert_eq!(
        engine.get_step(&run_id, "verify").await.unwrap().status,
        StepStatus::Waiting
    );

    // Second attempt sees the feedback.
    let claimed = engine.claim_next_step("dev", None).await.unwrap().unwrap();
    assert_eq!(claimed.story.as_ref().unwrap().retry_count, 1);
    assert_eq!(claimed.resolved_input, "Do S1. Feedback: missing validation");
    engine
        .complete_step(&run_id, "implement", text("STATUS: done"))
        .await
        .unwrap();
    engine.claim_next_step("reviewer", None).await.unwrap().unwrap();
    let outcome = engine
        .complete_step(&run_id, "verify", text("STATUS: done"))
        .await
        .unwrap();
    assert_eq!(outcome.story_status, Some(StoryStatus::Completed));

    // Second story goes straight through.
    let claimed = engine.claim_story(&run_id, "implement", None).await.unwrap().unwrap();
    assert_eq!(claimed.story.story_id, "S2");
    engine
        .complete_story(&run_id, "S2", text("STATUS: done"))
        .await
        .unwrap();
    engine.claim_next_step("reviewer", None).await.unwrap().unwrap();
    let outcome = engine
        .complete_step(&run_id, "verify", text("STATUS: done"))
        .await
        .unwrap();
    assert!(outcome.run_completed);

    let steps = engine.list_steps(&run_id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
    let stories = engine.list_step_stories(&run_id, "implement").await.unwrap();
    assert!(stories.iter().all(|s| s.status == StoryStatus::Completed));
}

#[tokio::test]
async fn rejected_story_without_retries_fails_the_run() {
    let (engine, wf) = setup(vec![
        step("implement", "dev", "{{current_story}}", story_loop(Some("verify"), Some(0))),
        step("verify", "reviewer", "check", StepKind::Single),
    ])
    .await;
    let run_id = engine
        .create_run(CreateRunInput {
            workflow_id: wf,
            task_id: "7".to_string(),
            context: RunContext::new(),
            start: false,
        })
        .await
        .unwrap()
        .id;
    engine
        .add_stories(
            &run_id,
            "implement",
            vec![StorySeed {
                id: "S1".to_string(),
                title: "Only".to_string(),
                description: String::new(),
                acceptance_criteria: vec![],
            }],
        )
        .await
        .unwrap();
    engine.update_run_status(&run_id, RunStatus::Running).await.unwrap();

    engine.claim_next_step("dev", None).await.unwrap().unwrap();
    engine
        .complete_step(&run_id, "implement", text("done"))
        .await
        .unwrap();
    engine.claim_next_step("reviewer", None).await.unwrap().unwrap();
    let outcome = engine
        .complete_step(&run_id, "verify", text("STATUS: fail\nISSUES: broken"))
        .await
        .unwrap();
    assert_eq!(outcome.story_status, Some(StoryStatus::Failed));
    assert_eq!(outcome.run_status, RunStatus::Failed);

    let story = engine.get_story(&run_id, "S1").await.unwrap();
    assert_eq!(story.error.as_deref(), Some("broken"));
    assert_eq!(
        engine.get_step(&run_id, "implement").await.unwrap().status,
        StepStatus::Failed
    );
}

#[tokio::test]
async fn loop_without_stories_completes_immediately() {
    let (engine, wf) = setup(vec![
        step("implement", "dev", "x", story_loop(None, None)),
        step("ship", "ops", "ship it", StepKind::Single),
    ])
    .await;
    let run_id = start_run(&engine, &wf, &[]).await;
    assert_eq!(
        engine.get_step(&run_id, "implement").await.unwrap().status,
        StepStatus::Completed
    );
    assert_eq!(
        engine.get_step(&run_id, "ship").await.unwrap().status,
        StepStatus::Pending
    );
}

#[tokio::test]
async fn approval_step_waits_for_a_decision() {
    let (engine, wf) = setup(vec![
        step(
            "release",
            "ops",
            "prepare release",
            StepKind::Approval(ApprovalConfig {
                instructions: Some("check the changelog".to_string()),
            }),
        ),
        step("announce", "ops", "announce", StepKind::Single),
    ])
    .await;
    let run_id = start_run(&engine, &wf, &[]).await;

    engine.claim_step(&run_id, "release", "ops").await.unwrap();
    let outcome = engine
        .complete_step(&run_id, "release", text("STATUS: ready"))
        .await
        .unwrap();
    assert_eq!(outcome.step_status, StepStatus::AwaitingApproval);
    assert!(!outcome.completed);
    assert!(engine.claim_next_step("ops", None).await.unwrap().is_none());

    let step = engine
        .update_step(
            &run_id,
            "release",
            UpdateStepInput {
                status: Some(StepStatus::Completed),
                output: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.output.as_deref(), Some("STATUS: ready"));
    assert_eq!(
        engine.get_step(&run_id, "announce").await.unwrap().status,
        StepStatus::Pending
    );
}

#[tokio::test]
async fn rejecting_an_approval_fails_the_run() {
    let (engine, wf) = setup(vec![step(
        "release",
        "ops",
        "prepare",
        StepKind::Approval(ApprovalConfig::default()),
    )])
    .await;
    let run_id = start_run(&engine, &wf, &[]).await;
    engine.claim_step(&run_id, "release", "ops").await.unwrap();
    engine
        .complete_step(&run_id, "release", text("ready"))
        .await
        .unwrap();

    let step = engine
        .update_step(
            &run_id,
            "release",
            UpdateStepInput {
                status: Some(StepStatus::Failed),
                output: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.error.as_deref(), Some("Rejected"));
    assert_eq!(
        engine.get_run(&run_id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn failure_reports_whether_a_retry_remains() {
    let mut build = step("build", "dev", "go", StepKind::Single);
    build.max_retries = Some(0);
    let (engine, wf) = setup(vec![build]).await;
    let run_id = start_run(&engine, &wf, &[]).await;

    let err = engine.fail_step(&run_id, "build", "boom").await.unwrap_err();
    assert!(matches!(err, ServerError::InvalidState { .. }));

    engine.claim_step(&run_id, "build", "dev").await.unwrap();
    let err = engine.fail_step(&run_id, "build", "  ").await.unwrap_err();
    assert!(matches!(err, ServerError::BadRequest(_)));

    let outcome = engine.fail_step(&run_id, "build", "boom").await.unwrap();
    assert!(!outcome.will_retry);
    assert_eq!(outcome.run_status, RunStatus::Failed);
    let step = engine.get_step(&run_id, "build").await.unwrap();
    assert_eq!(step.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn retry_budget_is_enforced_by_the_step_store() {
    let (engine, wf) = setup(vec![step("build", "dev", "go", StepKind::Single)]).await;
    let run_id = start_run(&engine, &wf, &[]).await;
    let step_id = engine.get_step(&run_id, "build").await.unwrap().id;

    let steps = StepStore::new(engine.db.clone());
    assert_eq!(steps.increment_retry(&step_id).await.unwrap(), 1);
    assert_eq!(steps.increment_retry(&step_id).await.unwrap(), 2);
    let err = steps.increment_retry(&step_id).await.unwrap_err();
    assert!(matches!(err, ServerError::RetriesExhausted { max_retries: 2 }));

    assert_eq!(
        engine.get_step(&run_id, "build").await.unwrap().status,
        StepStatus::Failed
    );
    assert_eq!(
        engine.get_run(&run_id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn manual_story_failure_is_final() {
    let (engine, wf) = setup(vec![step("implement", "dev", "x", story_loop(None, Some(3)))]).await;
    let run_id = engine
        .create_run(CreateRunInput {
            workflow_id: wf,
            task_id: "1".to_string(),
            context: RunContext::new(),
            start: false,
        })
        .await
        .unwrap()
        .id;
    let seeds = ["A", "B"]
        .iter()
        .map(|id| StorySeed {
            id: id.to_string(),
            title: format!("Story {}", id),
            description: String::new(),
            acceptance_criteria: vec![],
        })
        .collect();
    let created = engine.add_stories(&run_id, "implement", seeds).await.unwrap();
    let ids: HashSet<_> = created.iter().map(|s| s.story_id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    engine.update_run_status(&run_id, RunStatus::Running).await.unwrap();

    let story = engine
        .update_story(
            &run_id,
            "A",
            UpdateStoryInput {
                status: Some(StoryStatus::Failed),
                output: Some(text("not needed")),
            },
        )
        .await
        .unwrap();
    assert_eq!(story.status, StoryStatus::Failed);
    assert_eq!(story.retry_count, story.max_retries);
    assert_eq!(
        engine.get_run(&run_id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn cancelled_run_is_not_advanced() {
    let (engine, wf) = setup(vec![
        step("a", "dev", "a", StepKind::Single),
        step("b", "dev", "b", StepKind::Single),
    ])
    .await;
    let run_id = start_run(&engine, &wf, &[]).await;
    engine.claim_step(&run_id, "a", "dev").await.unwrap();
    engine
        .update_run_status(&run_id, RunStatus::Cancelled)
        .await
        .unwrap();

    engine.complete_step(&run_id, "a", text("done")).await.unwrap();
    assert_eq!(
        engine.get_step(&run_id, "b").await.unwrap().status,
        StepStatus::Waiting
    );
    assert_eq!(
        engine.get_run(&run_id).await.unwrap().status,
        RunStatus::Cancelled
    );

    let err = engine
        .update_run_status(&run_id, RunStatus::Pending)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::InvalidState { .. }));
}

fn seeds(ids: &[&str]) -> Vec<StorySeed> {
    ids.iter()
        .map(|id| StorySeed {
            id: id.to_string(),
            title: format!("Story {}", id),
            description: String::new(),
            acceptance_criteria: vec![],
        })
        .collect()
}

#[tokio::test]
async fn concurrent_explicit_claims_have_one_winner() {
    let (engine, wf) = setup(vec![step("build", "dev", "go", StepKind::Single)]).await;
    let run_id = start_run(&engine, &wf, &[]).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let run_id = run_id.clone();
        handles.push(tokio::spawn(async move {
            engine.claim_step(&run_id, "build", "dev").await
        }));
    }
    let (mut winners, mut refused) = (0, 0);
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(ServerError::NotClaimable { current_status, .. }) => {
                assert_eq!(current_status, "running");
                refused += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((winners, refused), (1, 7));

    let step = engine.get_step(&run_id, "build").await.unwrap();
    assert_eq!(step.status, StepStatus::Running);
    assert_eq!(step.claimed_by.as_deref(), Some("dev"));
}

#[tokio::test]
async fn verify_step_requires_verify_each() {
    let db = Database::open_in_memory().unwrap();
    let mut looped = story_loop(Some("verify"), None);
    if let StepKind::Loop(cfg) = &mut looped {
        cfg.verify_each = false;
    }
    let err = WorkflowStore::new(db)
        .create(CreateWorkflowInput {
            name: "skips-verify".to_string(),
            description: None,
            steps: vec![
                step("implement", "dev", "x", looped),
                step("verify", "reviewer", "check", StepKind::Single),
            ],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::BadRequest(ref m) if m.contains("verifyEach")));
}

#[tokio::test]
async fn story_retry_budget_is_enforced_by_the_story_store() {
    let (engine, wf) = setup(vec![step("implement", "dev", "x", story_loop(None, Some(1)))]).await;
    let run_id = engine
        .create_run(CreateRunInput {
            workflow_id: wf,
            task_id: "1".to_string(),
            context: RunContext::new(),
            start: false,
        })
        .await
        .unwrap()
        .id;
    let story = engine
        .add_stories(&run_id, "implement", seeds(&["A"]))
        .await
        .unwrap()
        .remove(0);
    engine.update_run_status(&run_id, RunStatus::Running).await.unwrap();

    let stories = StoryStore::new(engine.db.clone());
    assert_eq!(stories.increment_retry(&story.id).await.unwrap(), 1);
    let err = stories.increment_retry(&story.id).await.unwrap_err();
    assert!(matches!(err, ServerError::RetriesExhausted { max_retries: 1 }));

    let story = engine.get_story(&run_id, "A").await.unwrap();
    assert_eq!(story.status, StoryStatus::Failed);
    assert_eq!(story.retry_count, 1);
    assert_eq!(
        engine.get_step(&run_id, "implement").await.unwrap().status,
        StepStatus::Failed
    );
    assert_eq!(
        engine.get_run(&run_id).await.unwrap().status,
        RunStatus::Failed
    );
    assert!(matches!(
        stories.increment_retry("missing").await,
        Err(ServerError::NotFound(_))
    ));
}

#[tokio::test]
async fn starting_a_story_reports_the_loop_step_state() {
    let (engine, wf) = setup(vec![
        step("plan", "planner", "plan", StepKind::Single),
        step("implement", "dev", "{{current_story}}", story_loop(None, None)),
    ])
    .await;
    let run_id = start_run(&engine, &wf, &[]).await;
    engine
        .add_stories(&run_id, "implement", seeds(&["A", "B"]))
        .await
        .unwrap();

    // The loop has not been reached yet.
    match engine.start_story(&run_id, "A", None).await {
        Err(ServerError::NotClaimable {
            message,
            current_status,
        }) => {
            assert_eq!(current_status, "waiting");
            assert_eq!(message, "Loop step implement is waiting");
        }
        other => panic!("expected NotClaimable, got {:?}", other.map(|c| c.story.story_id)),
    }

    engine.claim_step(&run_id, "plan", "planner").await.unwrap();
    engine
        .complete_step(&run_id, "plan", text("STATUS: done"))
        .await
        .unwrap();
    engine.start_story(&run_id, "A", Some("dev-1")).await.unwrap();

    match engine.start_story(&run_id, "B", None).await {
        Err(ServerError::NotClaimable {
            message,
            current_status,
        }) => {
            assert_eq!(current_status, "running");
            assert!(message.contains("busy"), "{}", message);
        }
        other => panic!("expected NotClaimable, got {:?}", other.map(|c| c.story.story_id)),
    }
}

#[tokio::test]
async fn corrupt_step_status_is_not_read_as_waiting() {
    let (engine, wf) = setup(vec![step("build", "dev", "go", StepKind::Single)]).await;
    let run_id = start_run(&engine, &wf, &[]).await;
    engine
        .db
        .with_conn(|conn| {
            conn.execute(
                "UPDATE steps SET status = 'paused' WHERE run_id = ?1",
                rusqlite::params![run_id],
            )
        })
        .unwrap();

    let err = engine.get_step(&run_id, "build").await.unwrap_err();
    assert!(matches!(err, ServerError::Database(ref m) if m.contains("paused")));
}
