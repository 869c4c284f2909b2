pub mod run;
pub mod step;
pub mod story;
pub mod task;
pub mod workflow;

pub use run::*;
pub use step::*;
pub use story::*;
pub use task::*;
pub use workflow::*;

use serde::{Deserialize, Deserializer};

/// Task identifiers are opaque: accept either a JSON string or a number.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

pub(crate) fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    string_or_number(deserializer).map(Some)
}
