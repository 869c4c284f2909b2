//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! baton-core engine directly through `AppState`.

pub mod archive;
pub mod run;
pub mod server;
pub mod sweep;
pub mod workflow;

use std::sync::Arc;
use std::time::Duration;

use clap::Args;

use baton_core::{
    AppState, AppStateInner, ArchiveConfig, CoreConfig, Database, EngineConfig, SweeperConfig,
};

/// Engine and sweeper tunables shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct CoreArgs {
    /// Seconds between scheduler sweeps
    #[arg(long, env = "BATON_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub sweep_interval_secs: u64,
    /// Running work untouched for this many seconds is reclaimed
    #[arg(long, env = "BATON_ABANDONED_AFTER_SECS", default_value_t = 15 * 60)]
    pub abandoned_after_secs: u64,
    /// Failed work with retries left is requeued after this many seconds
    #[arg(long, env = "BATON_RETRY_COOLDOWN_SECS", default_value_t = 60)]
    pub retry_cooldown_secs: u64,
    /// Running runs without progress for this many seconds are failed
    #[arg(long, env = "BATON_RUN_TIMEOUT_SECS", default_value_t = 2 * 60 * 60)]
    pub run_timeout_secs: u64,
    /// Seconds between archive sweeps
    #[arg(long, env = "BATON_ARCHIVE_INTERVAL_SECS", default_value_t = 60 * 60)]
    pub archive_interval_secs: u64,
    /// Completed tasks are archived after this many hours
    #[arg(long, env = "BATON_ARCHIVE_DELAY_HOURS", default_value_t = 24)]
    pub archive_delay_hours: u64,
    /// Retry budget for steps that do not set their own
    #[arg(long, env = "BATON_DEFAULT_MAX_RETRIES", default_value_t = 2)]
    pub default_max_retries: u32,
}

impl CoreArgs {
    pub fn to_config(&self) -> CoreConfig {
        CoreConfig {
            engine: EngineConfig {
                default_max_retries: self.default_max_retries,
            },
            sweeper: SweeperConfig::default()
                .with_interval(Duration::from_secs(self.sweep_interval_secs))
                .with_abandoned_after(Duration::from_secs(self.abandoned_after_secs))
                .with_retry_cooldown(Duration::from_secs(self.retry_cooldown_secs))
                .with_run_timeout(Duration::from_secs(self.run_timeout_secs)),
            archive: ArchiveConfig {
                interval: Duration::from_secs(self.archive_interval_secs),
                delay: Duration::from_secs(self.archive_delay_hours * 60 * 60),
            },
        }
    }
}

/// Initialize a shared `AppState` from the given SQLite database path.
///
/// This mirrors `baton_server::create_app_state` for commands that never
/// bind a listener.
pub fn init_state(db_path: &str, config: CoreConfig) -> Result<AppState, String> {
    let db = Database::open(db_path)
        .map_err(|e| format!("Failed to open database '{}': {}", db_path, e))?;
    Ok(Arc::new(AppStateInner::with_config(db, config)))
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Serialize and pretty-print any value.
pub fn print_value<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_value(value).map_err(|e| e.to_string())?;
    print_json(&json);
    Ok(())
}
