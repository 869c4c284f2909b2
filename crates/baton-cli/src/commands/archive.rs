//! `baton archive`: Task archival: sweep, archive, restore, list, delete.

use baton_core::AppState;

use super::{print_json, print_value};

/// Archive every completed task past the configured delay.
pub async fn sweep(state: &AppState) -> Result<usize, String> {
    let archived = state
        .archive
        .archive_completed()
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "archived": archived }));
    Ok(archived)
}

pub async fn archive(state: &AppState, task_id: &str) -> Result<(), String> {
    let task = state
        .archive
        .archive_now(task_id)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&task)
}

pub async fn unarchive(state: &AppState, task_id: &str) -> Result<(), String> {
    let task = state
        .archive
        .unarchive(task_id)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&task)
}

pub async fn list(state: &AppState, page: Option<u32>, limit: Option<u32>) -> Result<(), String> {
    let page = state
        .archive
        .list_archived(page, limit)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&page)
}

pub async fn delete(state: &AppState, task_id: &str) -> Result<(), String> {
    state
        .archive
        .delete_archived(task_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("Deleted archived task {}", task_id);
    Ok(())
}
