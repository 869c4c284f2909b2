//! Scheduler sweeps over the run/step/story tables.
//!
//! Each sweep is a single transaction that only touches rows matching a stale
//! predicate, so running it repeatedly or alongside live claims is safe. Only
//! runs in `running` status are considered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::run::RunStatus;
use crate::store::run_store::set_run_status;
use crate::store::step_store::charge_step_retry;
use crate::store::story_store::charge_story_retry;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often the background task runs all three sweeps.
    pub interval: Duration,
    /// Running work not updated for this long is reclaimed.
    pub abandoned_after: Duration,
    /// Failed work with retries left is requeued after this long.
    pub retry_cooldown: Duration,
    /// Running runs with no progress for this long are failed.
    pub run_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            abandoned_after: Duration::from_secs(15 * 60),
            retry_cooldown: Duration::from_secs(60),
            run_timeout: Duration::from_secs(2 * 60 * 60),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_abandoned_after(mut self, age: Duration) -> Self {
        self.abandoned_after = age;
        self
    }

    pub fn with_retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.retry_cooldown = cooldown;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = timeout;
        self
    }
}

/// Per-category counts from one `run_all_scheduled` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub reclaimed: usize,
    pub requeued: usize,
    pub timed_out: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.reclaimed + self.requeued + self.timed_out
    }
}

const RUNNING_RUNS: &str = "SELECT id FROM runs WHERE status = 'running'";

#[derive(Clone)]
pub struct Sweeper {
    db: Database,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(db: Database, config: SweeperConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Reset `running` steps and stories untouched for `abandoned_after` to
    /// their pre-claim state. Loop steps left with nothing in flight go back
    /// to `pending`. Returns the number of units reclaimed.
    pub async fn reclaim_abandoned(&self, now: DateTime<Utc>) -> Result<usize, ServerError> {
        let cutoff = cutoff_ms(now, self.config.abandoned_after);
        let now_ms = now.timestamp_millis();
        self.db
            .transaction(move |tx| {
                let stories = tx.execute(
                    &format!(
                        "UPDATE stories SET status = 'pending', claimed_by = NULL,
                           claimed_at = NULL, updated_at = ?1
                         WHERE status = 'running' AND updated_at < ?2
                           AND run_id IN ({})",
                        RUNNING_RUNS
                    ),
                    rusqlite::params![now_ms, cutoff],
                )?;
                let steps = tx.execute(
                    &format!(
                        "UPDATE steps SET status = COALESCE(previous_status, 'pending'),
                           claimed_by = NULL, claimed_at = NULL, previous_status = NULL,
                           updated_at = ?1
                         WHERE status = 'running' AND kind != 'loop' AND updated_at < ?2
                           AND run_id IN ({})",
                        RUNNING_RUNS
                    ),
                    rusqlite::params![now_ms, cutoff],
                )?;
                tx.execute(
                    &format!(
                        "UPDATE steps SET status = 'pending', current_story_id = NULL,
                           claimed_by = NULL, claimed_at = NULL, previous_status = NULL,
                           updated_at = ?1
                         WHERE status = 'running' AND kind = 'loop'
                           AND run_id IN ({})
                           AND NOT EXISTS (
                             SELECT 1 FROM stories st WHERE st.step_id = steps.id
                               AND st.status IN ('running', 'verifying'))",
                        RUNNING_RUNS
                    ),
                    rusqlite::params![now_ms],
                )?;
                Ok(stories + steps)
            })
            .await
    }

    /// Put `failed` units with retries left back to `pending` once they have
    /// cooled down, charging the attempt to their retry budget. Returns the
    /// number requeued.
    pub async fn requeue_failed(&self, now: DateTime<Utc>) -> Result<usize, ServerError> {
        let cutoff = cutoff_ms(now, self.config.retry_cooldown);
        let now_ms = now.timestamp_millis();
        self.db
            .transaction(move |tx| {
                let mut requeued = 0;
                for id in stale_failed(tx, "stories", cutoff)? {
                    if charge_story_retry(tx, &id, now)?.is_some() {
                        tx.execute(
                            "UPDATE stories SET status = 'pending', claimed_by = NULL,
                               claimed_at = NULL, updated_at = ?1
                             WHERE id = ?2",
                            rusqlite::params![now_ms, id],
                        )?;
                        requeued += 1;
                    }
                }
                for id in stale_failed(tx, "steps", cutoff)? {
                    if charge_step_retry(tx, &id, now)?.is_some() {
                        tx.execute(
                            "UPDATE steps SET status = 'pending', claimed_by = NULL,
                               claimed_at = NULL, previous_status = NULL, updated_at = ?1
                             WHERE id = ?2",
                            rusqlite::params![now_ms, id],
                        )?;
                        requeued += 1;
                    }
                }
                Ok(requeued)
            })
            .await
    }

    /// Fail `running` runs with no progress for `run_timeout`, together with
    /// their in-flight steps and stories. Runs waiting on an approval are
    /// left alone. Returns the number of runs failed.
    pub async fn timeout_stuck_runs(&self, now: DateTime<Utc>) -> Result<usize, ServerError> {
        let cutoff = cutoff_ms(now, self.config.run_timeout);
        let now_ms = now.timestamp_millis();
        self.db
            .transaction(move |tx| {
                let mut stmt = tx.prepare(
                    "SELECT id FROM runs WHERE status = 'running' AND updated_at < ?1
                       AND NOT EXISTS (
                         SELECT 1 FROM steps WHERE steps.run_id = runs.id
                           AND steps.status = 'awaiting_approval')",
                )?;
                let stuck = stmt
                    .query_map(rusqlite::params![cutoff], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;

                for run_id in &stuck {
                    set_run_status(tx, run_id, RunStatus::Failed, now)?;
                    tx.execute(
                        "UPDATE steps SET status = 'failed', error = COALESCE(error, 'Run timed out'),
                           updated_at = ?1
                         WHERE run_id = ?2 AND status IN ('pending', 'running')",
                        rusqlite::params![now_ms, run_id],
                    )?;
                    tx.execute(
                        "UPDATE stories SET status = 'failed', error = COALESCE(error, 'Run timed out'),
                           updated_at = ?1
                         WHERE run_id = ?2 AND status IN ('running', 'verifying')",
                        rusqlite::params![now_ms, run_id],
                    )?;
                    tracing::warn!("Run {} timed out", run_id);
                }
                Ok(stuck.len())
            })
            .await
    }

    /// Run all three sweeps at `now`.
    pub async fn run_all_at(&self, now: DateTime<Utc>) -> Result<SweepReport, ServerError> {
        let report = SweepReport {
            reclaimed: self.reclaim_abandoned(now).await?,
            requeued: self.requeue_failed(now).await?,
            timed_out: self.timeout_stuck_runs(now).await?,
        };
        if report.total() > 0 {
            tracing::info!(
                "Sweep: reclaimed {}, requeued {}, timed out {}",
                report.reclaimed,
                report.requeued,
                report.timed_out
            );
        } else {
            tracing::debug!("Sweep: nothing to do");
        }
        Ok(report)
    }

    pub async fn run_all_scheduled(&self) -> Result<SweepReport, ServerError> {
        self.run_all_at(Utc::now()).await
    }
}

/// Ids of `failed` rows in `table` with retries left, idle since before
/// `cutoff`, belonging to running runs.
fn stale_failed(
    conn: &rusqlite::Connection,
    table: &str,
    cutoff: i64,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id FROM {} WHERE status = 'failed' AND retry_count < max_retries
           AND updated_at < ?1 AND run_id IN ({})",
        table, RUNNING_RUNS
    ))?;
    let ids = stmt
        .query_map(rusqlite::params![cutoff], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn cutoff_ms(now: DateTime<Utc>, age: Duration) -> i64 {
    now.timestamp_millis() - age.as_millis() as i64
}
