use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

use super::{json_column, ms_to_dt, to_json};
use crate::db::Database;
use crate::error::ServerError;
use crate::models::workflow::{CreateWorkflowInput, Workflow};

#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateWorkflowInput) -> Result<Workflow, ServerError> {
        input.validate().map_err(ServerError::BadRequest)?;

        let now = Utc::now();
        let wf = Workflow {
            id: Uuid::new_v4().to_string(),
            steps: input.ordered_steps(),
            name: input.name,
            description: input.description,
            created_at: now,
            updated_at: now,
        };
        let wc = wf.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, description, steps, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        wc.id,
                        wc.name,
                        wc.description,
                        to_json(&wc.steps),
                        wc.created_at.timestamp_millis(),
                        wc.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        tracing::info!("Created workflow '{}' ({} steps)", wf.name, wf.steps.len());
        Ok(wf)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| load_workflow(conn, &id))
            .await
    }

    pub async fn list(&self) -> Result<Vec<Workflow>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, steps, created_at, updated_at
                     FROM workflows ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map([], row_to_workflow)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Delete a workflow. Rejected while any of its runs is non-terminal.
    pub async fn delete(&self, id: &str) -> Result<(), ServerError> {
        let id = id.to_string();
        self.db
            .transaction(move |tx| {
                if load_workflow(tx, &id)?.is_none() {
                    return Err(ServerError::NotFound("Workflow not found".to_string()));
                }
                let active: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM runs WHERE workflow_id = ?1
                     AND status IN ('pending', 'running')",
                    rusqlite::params![id],
                    |row| row.get(0),
                )?;
                if active > 0 {
                    return Err(ServerError::Conflict(format!(
                        "Workflow has {} active run(s)",
                        active
                    )));
                }
                // Terminal runs go with it; steps and stories cascade.
                tx.execute("DELETE FROM runs WHERE workflow_id = ?1", rusqlite::params![id])?;
                tx.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])?;
                Ok(())
            })
            .await
    }
}

pub(crate) fn load_workflow(conn: &Connection, id: &str) -> rusqlite::Result<Option<Workflow>> {
    conn.query_row(
        "SELECT id, name, description, steps, created_at, updated_at
         FROM workflows WHERE id = ?1",
        rusqlite::params![id],
        row_to_workflow,
    )
    .optional()
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workflow> {
    Ok(Workflow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        steps: json_column(row, 3)?,
        created_at: ms_to_dt(row.get(4)?),
        updated_at: ms_to_dt(row.get(5)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::workflow::{StepDefinition, StepKind};

    fn input() -> CreateWorkflowInput {
        CreateWorkflowInput {
            name: "feature-dev".to_string(),
            description: Some("plan then build".to_string()),
            steps: vec![StepDefinition {
                step_id: "plan".to_string(),
                agent_id: "planner".to_string(),
                input_template: "Plan {{task}}".to_string(),
                expects: "STATUS: done".to_string(),
                kind: StepKind::Single,
                max_retries: None,
                position: 0,
            }],
        }
    }

    #[tokio::test]
    async fn create_get_list_delete() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let wf = store.create(input()).await.unwrap();

        let loaded = store.get(&wf.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "feature-dev");
        assert_eq!(loaded.steps, wf.steps);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&wf.id).await.unwrap();
        assert!(store.get(&wf.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete(&wf.id).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn create_rejects_invalid_definitions() {
        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let mut bad = input();
        bad.name = String::new();
        assert!(matches!(store.create(bad).await, Err(ServerError::BadRequest(_))));
    }
}
