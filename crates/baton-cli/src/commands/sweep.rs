//! `baton sweep`: Run one scheduler sweep immediately.

use baton_core::{AppState, SweepReport};

use super::print_value;

pub async fn run(state: &AppState) -> Result<SweepReport, String> {
    let report = state
        .sweeper
        .run_all_scheduled()
        .await
        .map_err(|e| e.to_string())?;
    tracing::debug!("Manual sweep finished: {:?}", report);
    print_value(&report)?;
    Ok(report)
}
