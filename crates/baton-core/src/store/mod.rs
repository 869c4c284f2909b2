pub mod run_store;
pub mod step_store;
pub mod story_store;
pub mod task_store;
pub mod workflow_store;

pub use run_store::RunStore;
pub use step_store::StepStore;
pub use story_store::StoryStore;
pub use task_store::TaskStore;
pub use workflow_store::WorkflowStore;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

pub(crate) fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

pub(crate) fn opt_ms_to_dt(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// Decode a JSON text column, surfacing bad data as a conversion error.
pub(crate) fn json_column<T: DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Decode a status column, surfacing unknown values as a conversion error.
pub(crate) fn status_column<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    parse(&text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown status '{}'", text).into(),
        )
    })
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}
