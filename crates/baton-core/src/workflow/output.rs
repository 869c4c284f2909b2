//! Interpretation of free-text agent output.
//!
//! Agents report results as line-oriented `KEY: value` pairs anywhere in their
//! output. Those pairs become run context (lowercased keys). A reserved key,
//! `STORIES_JSON`, carries a JSON array of stories for the next loop step and
//! never enters the context.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::{RunContext, StorySeed};

/// Reserved key carrying the structured story list.
pub const STORIES_KEY: &str = "STORIES_JSON";

/// Upper bound on stories accepted from a single output.
pub const MAX_STORIES: usize = 20;

lazy_static! {
    static ref KEY_LINE: Regex =
        Regex::new(r"^\s*([A-Z][A-Z0-9_]*):(.*)$").expect("key line regex");
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum OutputError {
    #[error("STORIES_JSON has {count} stories; at most {max} are allowed")]
    TooManyStories { count: usize, max: usize },

    #[error("invalid STORIES_JSON: {0}")]
    InvalidStories(String),
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let caps = KEY_LINE.captures(line.trim_end_matches('\r'))?;
    let key = caps.get(1)?.as_str();
    let value = caps.get(2)?.as_str().trim();
    Some((key, value))
}

/// Merge `KEY: value` lines from `raw` into a copy of `existing`.
///
/// Keys are lowercased, later lines win, unrelated keys are kept, empty
/// values are skipped and the reserved stories key is ignored.
pub fn merge_context_from_output(raw: &str, existing: &RunContext) -> RunContext {
    let mut merged = existing.clone();
    for line in raw.lines() {
        let Some((key, value)) = key_value(line) else {
            continue;
        };
        if key == STORIES_KEY || value.is_empty() {
            continue;
        }
        merged.insert(key.to_lowercase(), value.to_string());
    }
    merged
}

/// Extract the `STORIES_JSON` payload from `raw`.
///
/// Returns an empty list when the key is absent. A present but unparseable
/// payload is an error, as is a list longer than [`MAX_STORIES`].
pub fn parse_structured_stories(raw: &str) -> Result<Vec<StorySeed>, OutputError> {
    let mut lines = raw.lines();
    let mut payload = String::new();

    let mut found = false;
    for line in lines.by_ref() {
        if let Some((key, rest)) = key_value(line) {
            if key == STORIES_KEY {
                payload.push_str(rest);
                found = true;
                break;
            }
        }
    }
    if !found {
        return Ok(Vec::new());
    }

    for line in lines {
        if key_value(line).is_some() {
            break;
        }
        if line.trim_start().starts_with("```") {
            continue;
        }
        payload.push('\n');
        payload.push_str(line);
    }

    let payload = payload.trim();
    if payload.is_empty() {
        return Err(OutputError::InvalidStories("payload is empty".to_string()));
    }

    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| OutputError::InvalidStories(e.to_string()))?;
    let entries = value
        .as_array()
        .ok_or_else(|| OutputError::InvalidStories("expected a JSON array".to_string()))?;

    if entries.len() > MAX_STORIES {
        return Err(OutputError::TooManyStories {
            count: entries.len(),
            max: MAX_STORIES,
        });
    }

    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let seed: StorySeed = serde_json::from_value(entry.clone())
                .map_err(|e| OutputError::InvalidStories(format!("story {}: {}", i, e)))?;
            if seed.id.trim().is_empty() {
                return Err(OutputError::InvalidStories(format!("story {}: id is required", i)));
            }
            if seed.title.trim().is_empty() {
                return Err(OutputError::InvalidStories(format!("story {}: title is required", i)));
            }
            Ok(seed)
        })
        .collect()
}
