//! `{{name}}` placeholder rendering against a run's context.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::models::RunContext;

lazy_static! {
    static ref PLACEHOLDER: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder regex");
}

/// Replace every `{{name}}` with the matching context value.
///
/// Lookup is case-insensitive (context keys are stored lowercase). A name with
/// no value renders as `[missing: name]` so a partially resolved template still
/// reaches the agent.
pub fn resolve_template(template: &str, context: &RunContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let name = &caps[1];
            match context.get(&name.to_lowercase()) {
                Some(value) => value.clone(),
                None => format!("[missing: {}]", name),
            }
        })
        .into_owned()
}
