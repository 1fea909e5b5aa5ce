//! The sync loop: one batch at a time, from chain head to checkpoint.
//!
//! Each iteration:
//!
//! ```text
//! current_height → scheduler.next_range → fetcher.fetch_range (families in parallel)
//!   → dispatcher.apply_batch (one commit) → checkpoint.commit_batch
//! ```
//!
//! On a batch-aborting error nothing advances: the failure is recorded, the
//! provider may be rotated, and the failed range itself is retried after the
//! combined scheduler/backoff delay, even if the head has moved meanwhile.
//! Shutdown is observed only between batches.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use chainsync_core::checkpoint::{CheckpointManager, CommitOutcome};
use chainsync_core::error::SyncError;
use chainsync_core::failure::{combined_delay, FailureController};
use chainsync_core::scheduler::BatchScheduler;
use chainsync_core::types::BlockRange;
use chainsync_rpc::ChainClient;

use crate::dispatcher::Dispatcher;
use crate::fetcher::EventFetcher;

/// Counters shared with the health reporter. Written only by the loop.
#[derive(Debug, Default)]
pub struct SyncStats {
    last_indexed_block: AtomicU64,
    head_block: AtomicU64,
    events_processed: AtomicU64,
    batches: AtomicU64,
    consecutive_errors: AtomicU32,
    in_flight: AtomicBool,
    avg_batch_ms: AtomicU64,
}

/// Point-in-time copy of [`SyncStats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub last_indexed_block: u64,
    pub head_block: u64,
    pub events_processed: u64,
    pub batches: u64,
    pub consecutive_errors: u32,
    pub in_flight: bool,
    pub avg_batch_ms: u64,
}

impl SyncStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            last_indexed_block: self.last_indexed_block.load(Ordering::Relaxed),
            head_block: self.head_block.load(Ordering::Relaxed),
            events_processed: self.events_processed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            avg_batch_ms: self.avg_batch_ms.load(Ordering::Relaxed),
        }
    }
}

/// Holds the in-flight flag for the duration of one batch.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Outcome of one loop iteration.
#[derive(Debug)]
pub enum Step {
    /// A range was fetched, projected and checkpointed.
    Committed {
        range: BlockRange,
        events: usize,
        outcome: CommitOutcome,
    },
    /// Nothing between the checkpoint and the safe head (or the target).
    CaughtUp { head: u64 },
    /// The batch failed and will be retried unchanged.
    Failed {
        error: SyncError,
        range: Option<BlockRange>,
        retry_in: Duration,
    },
}

pub struct SyncLoop {
    client: Arc<dyn ChainClient>,
    fetcher: EventFetcher,
    dispatcher: Dispatcher,
    checkpoint: CheckpointManager,
    scheduler: BatchScheduler,
    failures: FailureController,
    stats: Arc<SyncStats>,
    shutdown: watch::Receiver<bool>,
    /// Range of the last failed batch, retried as-is.
    retry: Option<BlockRange>,
}

impl SyncLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ChainClient>,
        fetcher: EventFetcher,
        dispatcher: Dispatcher,
        checkpoint: CheckpointManager,
        scheduler: BatchScheduler,
        failures: FailureController,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let stats = Arc::new(SyncStats::default());
        stats
            .last_indexed_block
            .store(checkpoint.last_indexed_block(), Ordering::Relaxed);
        Self {
            client,
            fetcher,
            dispatcher,
            checkpoint,
            scheduler,
            failures,
            stats,
            shutdown,
            retry: None,
        }
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        Arc::clone(&self.stats)
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    pub fn failures(&self) -> &FailureController {
        &self.failures
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run until shutdown is signalled or a non-retryable error occurs.
    pub async fn run(&mut self) -> Result<(), SyncError> {
        self.run_inner(None).await
    }

    /// Run until `last_indexed_block >= target` (or shutdown).
    pub async fn run_until(&mut self, target: u64) -> Result<(), SyncError> {
        self.run_inner(Some(target)).await
    }

    async fn run_inner(&mut self, target: Option<u64>) -> Result<(), SyncError> {
        info!(
            indexer_id = %self.checkpoint.state().indexer_id,
            last_indexed = self.checkpoint.last_indexed_block(),
            families = ?self.fetcher.families(),
            target = ?target,
            "sync loop starting"
        );

        let result = loop {
            if *self.shutdown.borrow() {
                info!("shutdown requested, stopping before next batch");
                break Ok(());
            }
            if self.reached(target) {
                break Ok(());
            }

            let delay = match self.step(target).await {
                Ok(Step::Committed { .. }) => self.scheduler.inter_batch_delay(0),
                Ok(Step::CaughtUp { .. }) => self.scheduler.idle_delay(),
                Ok(Step::Failed { retry_in, .. }) => retry_in,
                Err(e) => break Err(e),
            };

            if self.reached(target) {
                break Ok(());
            }
            if self.pause(delay).await {
                info!("shutdown requested, stopping before next batch");
                break Ok(());
            }
        };

        if let Err(e) = self.checkpoint.flush().await {
            warn!(error = %e, "failed to flush checkpoint on exit");
            if result.is_ok() {
                return Err(e);
            }
        }
        info!(
            last_indexed = self.checkpoint.last_indexed_block(),
            "sync loop stopped"
        );
        result
    }

    fn reached(&self, target: Option<u64>) -> bool {
        target.is_some_and(|t| self.checkpoint.last_indexed_block() >= t)
    }

    /// Sleep for `delay`; returns `true` if shutdown was signalled meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return *self.shutdown.borrow();
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = self.shutdown.changed() => match changed {
                Ok(()) => *self.shutdown.borrow(),
                // Sender gone: nobody can ask us to stop any more.
                Err(_) => {
                    tokio::time::sleep(delay).await;
                    false
                }
            },
        }
    }

    /// Process at most one batch, never past `target`.
    ///
    /// Batch-aborting errors are returned as [`Step::Failed`]; anything else
    /// is fatal and returned as `Err`. After a failed batch the next step
    /// retries the same range unless it no longer follows the checkpoint or
    /// the safe head has dropped below its end.
    pub async fn step(&mut self, target: Option<u64>) -> Result<Step, SyncError> {
        let stats = Arc::clone(&self.stats);
        let _guard = InFlight::acquire(&stats.in_flight).ok_or_else(|| SyncError::Aborted {
            reason: "a batch is already in flight".into(),
        })?;

        let head = match self.client.current_height().await {
            Ok(head) => head,
            Err(e) => return Ok(self.fail(e.into(), None).await),
        };
        self.stats.head_block.store(head, Ordering::Relaxed);

        let last = self.checkpoint.last_indexed_block();
        let retry = self.retry.take();
        let Some(plan) = self.scheduler.next_range(last, head) else {
            return Ok(Step::CaughtUp { head });
        };
        let mut range = match retry {
            Some(r) if r.from == plan.range.from && r.to <= self.scheduler.safe_head(head) => {
                debug!(from = r.from, to = r.to, "retrying failed range");
                r
            }
            _ => plan.range,
        };
        if let Some(t) = target {
            if range.from > t {
                return Ok(Step::CaughtUp { head });
            }
            range.to = range.to.min(t);
        }

        let started = Instant::now();
        match self.process(range).await {
            Ok((events, outcome)) => {
                let elapsed = started.elapsed();
                self.scheduler.record_batch_duration(elapsed);
                self.failures.record_success();
                self.publish(events);
                info!(
                    from = range.from,
                    to = range.to,
                    lag = plan.lag,
                    batch_size = plan.size,
                    events,
                    ?outcome,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "batch committed"
                );
                Ok(Step::Committed {
                    range,
                    events,
                    outcome,
                })
            }
            Err(e) if e.aborts_batch() => {
                self.retry = Some(range);
                Ok(self.fail(e, Some(range)).await)
            }
            Err(e) => Err(e),
        }
    }

    async fn process(&mut self, range: BlockRange) -> Result<(usize, CommitOutcome), SyncError> {
        let batch = self.fetcher.fetch_range(range).await?;
        self.dispatcher.apply_batch(&batch.records).await?;
        let outcome = self
            .checkpoint
            .commit_batch(range, &batch.block_events())
            .await?;
        Ok((batch.total_events(), outcome))
    }

    fn publish(&self, events: usize) {
        let s = &self.stats;
        s.last_indexed_block
            .store(self.checkpoint.last_indexed_block(), Ordering::Relaxed);
        s.events_processed.fetch_add(events as u64, Ordering::Relaxed);
        s.batches.fetch_add(1, Ordering::Relaxed);
        s.consecutive_errors.store(0, Ordering::Relaxed);
        s.avg_batch_ms
            .store(self.scheduler.average_batch_ms() as u64, Ordering::Relaxed);
    }

    async fn fail(&mut self, error: SyncError, range: Option<BlockRange>) -> Step {
        self.failures.record_failure(&error);
        self.checkpoint.record_error(&error, range).await;

        if self.failures.should_failover() {
            warn!(
                consecutive = self.failures.consecutive_failures(),
                "failure threshold reached, rotating provider"
            );
            self.client.force_rotate();
            for p in self.client.health() {
                warn!(
                    url = %p.url,
                    weight = p.weight,
                    circuit = ?p.circuit,
                    consecutive_failures = p.consecutive_failures,
                    total_failures = p.total_failures,
                    "provider health"
                );
            }
            self.failures.acknowledge_failover();
        }

        let consecutive = self.failures.consecutive_failures();
        self.stats
            .consecutive_errors
            .store(consecutive, Ordering::Relaxed);
        let retry_in = combined_delay(
            self.scheduler.inter_batch_delay(consecutive),
            self.failures.backoff_delay(),
        );
        Step::Failed {
            error,
            range,
            retry_in,
        }
    }
}
