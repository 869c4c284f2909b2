//! Background sweepers.
//!
//! Two long-lived tokio tasks, one per sweep kind, each ticking on its own
//! interval until the shared [`CancellationToken`] fires.

pub mod archive;
pub mod sweeper;

pub use archive::{ArchiveConfig, ArchiveSweeper};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Handles to the running sweeper tasks.
pub struct BackgroundSweepers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundSweepers {
    /// Spawn both sweep loops. Must be called inside a tokio runtime.
    pub fn start(sweeper: Sweeper, archive: ArchiveSweeper) -> Self {
        let token = CancellationToken::new();
        let handles = vec![
            spawn_scheduler_loop(sweeper, token.child_token()),
            spawn_archive_loop(archive, token.child_token()),
        ];
        tracing::info!("Background sweepers started");
        Self { token, handles }
    }

    /// Token that stops every loop when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("Sweeper task ended abnormally: {}", e);
            }
        }
        tracing::info!("Background sweepers stopped");
    }
}

fn spawn_scheduler_loop(sweeper: Sweeper, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweeper.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweeper.run_all_scheduled().await {
                        tracing::warn!("Scheduled sweep failed: {}", e);
                    }
                }
            }
        }
    })
}

fn spawn_archive_loop(archive: ArchiveSweeper, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(archive.config().interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = archive.archive_completed().await {
                        tracing::warn!("Archive sweep failed: {}", e);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::time::Duration;

    #[tokio::test]
    async fn sweepers_stop_on_shutdown() {
        let db = Database::open_in_memory().unwrap();
        let sweepers = BackgroundSweepers::start(
            Sweeper::new(
                db.clone(),
                SweeperConfig::default().with_interval(Duration::from_millis(10)),
            ),
            ArchiveSweeper::new(
                db,
                ArchiveConfig {
                    interval: Duration::from_millis(10),
                    ..ArchiveConfig::default()
                },
            ),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), sweepers.shutdown())
            .await
            .expect("sweepers did not stop");
    }
}
