//! Periodic health snapshots.
//!
//! Runs on its own timer and only reads [`SyncStats`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::sync_loop::SyncStats;

pub struct HealthReporter {
    stats: Arc<SyncStats>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HealthReporter {
    pub fn new(stats: Arc<SyncStats>, interval: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            stats,
            interval,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Log a snapshot every interval until shutdown.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let s = self.stats.snapshot();
                    info!(
                        last_indexed = s.last_indexed_block,
                        head = s.head_block,
                        lag = s.head_block.saturating_sub(s.last_indexed_block),
                        events = s.events_processed,
                        batches = s.batches,
                        consecutive_errors = s.consecutive_errors,
                        in_flight = s.in_flight,
                        avg_batch_ms = s.avg_batch_ms,
                        "indexer health"
                    );
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
