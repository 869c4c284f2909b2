//! End-to-end checks against a real listener on an ephemeral port.

use std::sync::Arc;

use serde_json::{json, Value};

use baton_core::{AppStateInner, Database};
use baton_server::{start_server_with_state, ServerConfig};

struct TestServer {
    base: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        let db = Database::open_in_memory().unwrap();
        let state = Arc::new(AppStateInner::new(db));
        let config = ServerConfig {
            port: 0,
            run_sweepers: false,
            ..ServerConfig::default()
        };
        let handle = start_server_with_state(config, state).await.unwrap();
        Self {
            base: format!("http://{}", handle.addr),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn patch(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .patch(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn workflow(&self) -> String {
        let (status, body) = self
            .post(
                "/api/workflows",
                json!({
                    "name": "ship-it",
                    "steps": [
                        { "stepId": "plan", "agentId": "planner", "inputTemplate": "Plan {{goal}}" },
                        { "stepId": "build", "agentId": "dev", "inputTemplate": "Build {{plan}}" }
                    ]
                }),
            )
            .await;
        assert_eq!(status, 201, "{}", body);
        body["id"].as_str().unwrap().to_string()
    }

    async fn run(&self, workflow_id: &str) -> String {
        let (status, body) = self
            .post(
                "/api/runs",
                json!({ "workflowId": workflow_id, "taskId": 17, "context": { "GOAL": "search" } }),
            )
            .await;
        assert_eq!(status, 201, "{}", body);
        body["id"].as_str().unwrap().to_string()
    }
}

#[tokio::test]
async fn health_check_responds() {
    let server = TestServer::start().await;
    let (status, body) = server.get("/api/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn two_step_run_over_http() {
    let server = TestServer::start().await;
    let wf = server.workflow().await;
    let run = server.run(&wf).await;

    let (status, body) = server.get(&format!("/api/runs/{}/steps/pending", run)).await;
    assert_eq!(status, 200);
    assert_eq!(body["steps"].as_array().unwrap().len(), 1);

    let (status, body) = server
        .post("/api/runs/claim", json!({ "agentId": "planner" }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["claimed"]["resolvedInput"], "Plan search");

    let (status, body) = server
        .post(
            &format!("/api/runs/{}/steps/plan/complete", run),
            json!({ "output": "STATUS: done\nPLAN: index first" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["completed"], true);
    assert_eq!(body["runCompleted"], false);

    let (status, body) = server
        .post(
            &format!("/api/runs/{}/steps/build/claim", run),
            json!({ "agentId": "dev" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["resolvedInput"], "Build index first");

    let (status, body) = server
        .post(
            &format!("/api/runs/{}/steps/build/complete", run),
            json!({ "output": { "status": "done" } }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["runCompleted"], true);

    let (_, body) = server.get(&format!("/api/runs/{}", run)).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["taskId"], "17");
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let server = TestServer::start().await;
    let wf = server.workflow().await;
    let run = server.run(&wf).await;

    let (status, body) = server.get("/api/runs/nope").await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Run not found");

    let (status, body) = server.get(&format!("/api/runs/{}/steps/nope", run)).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "Step not found");

    let (status, _) = server
        .post(
            "/api/runs",
            json!({ "workflowId": "missing", "taskId": "1" }),
        )
        .await;
    assert_eq!(status, 404);

    // Wrong agent.
    let (status, _) = server
        .post(
            &format!("/api/runs/{}/steps/plan/claim", run),
            json!({ "agentId": "dev" }),
        )
        .await;
    assert_eq!(status, 403);

    // Completing a step nobody claimed.
    let (status, body) = server
        .post(
            &format!("/api/runs/{}/steps/plan/complete", run),
            json!({ "output": "done" }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["currentStatus"], "pending");

    // Claimed twice.
    let (status, _) = server
        .post(
            &format!("/api/runs/{}/steps/plan/claim", run),
            json!({ "agentId": "planner" }),
        )
        .await;
    assert_eq!(status, 200);
    let (status, body) = server
        .post(
            &format!("/api/runs/{}/steps/plan/claim", run),
            json!({ "agentId": "planner" }),
        )
        .await;
    assert_eq!(status, 409);
    assert_eq!(body["currentStatus"], "running");

    // Failure needs a message.
    let (status, _) = server
        .post(&format!("/api/runs/{}/steps/plan/fail", run), json!({}))
        .await;
    assert_eq!(status, 400);
    let (status, body) = server
        .post(
            &format!("/api/runs/{}/steps/plan/fail", run),
            json!({ "error": "agent crashed" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["willRetry"], true);
    assert_eq!(body["status"], "failed");

    let (status, _) = server
        .patch(
            &format!("/api/runs/{}/status", run),
            json!({ "status": "paused" }),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = server
        .patch(
            &format!("/api/runs/{}/status", run),
            json!({ "status": "cancelled" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "cancelled");

    let (status, body) = server
        .post(
            &format!("/api/runs/{}/steps/build/claim", run),
            json!({ "agentId": "dev" }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["currentStatus"], "cancelled");
}

#[tokio::test]
async fn archive_surface_enforces_preconditions() {
    let server = TestServer::start().await;

    let (status, _) = server
        .post("/api/tasks", json!({ "id": 5, "title": "Write docs" }))
        .await;
    assert_eq!(status, 201);

    let (status, body) = server.post("/api/tasks/5/archive", json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["currentStatus"], "todo");

    let (status, _) = server
        .post("/api/tasks/5/status", json!({ "status": "completed" }))
        .await;
    assert_eq!(status, 200);

    let (status, body) = server.post("/api/tasks/5/archive", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "archived");
    let (status, _) = server.post("/api/tasks/5/archive", json!({})).await;
    assert_eq!(status, 409);

    let (status, body) = server.get("/api/tasks/archived?page=1&limit=10").await;
    assert_eq!(status, 200);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], "5");

    let (status, body) = server.get("/api/tasks/5/activity").await;
    assert_eq!(status, 200);
    let activity = body["activity"].as_array().unwrap();
    assert_eq!(activity.last().unwrap()["source"], "manual");

    let (status, body) = server.post("/api/tasks/5/unarchive", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "completed");

    let resp = server
        .client
        .delete(format!("{}/api/tasks/archived/5", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let (status, body) = server.post("/api/scheduler/sweep", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["reclaimed"], 0);
    let (status, body) = server.post("/api/scheduler/archive", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["archived"], 0);
}
