//! Batch scheduler: picks the next block range and the pause before it.
//!
//! Batch size follows three discrete lag tiers:
//!
//! ```text
//! lag > large_lag_threshold   → max_batch_size
//! lag > medium_lag_threshold  → medium_batch_size
//! otherwise                   → steady_batch_size
//! ```
//!
//! where `lag = head - last_indexed - confirmation_depth`. The range never
//! extends past `head - confirmation_depth`.

use std::time::Duration;

use crate::types::BlockRange;

/// Weight of the newest sample in the batch-time moving average.
const EWMA_ALPHA: f64 = 0.1;

/// Largest power of two applied to the delay for consecutive failures.
const MAX_FAILURE_EXPONENT: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Blocks behind head considered too young to index.
    pub confirmation_depth: u64,
    pub steady_batch_size: u64,
    pub medium_batch_size: u64,
    pub max_batch_size: u64,
    pub medium_lag_threshold: u64,
    pub large_lag_threshold: u64,
    /// Pause between batches under normal conditions.
    pub base_delay: Duration,
    /// Pause when there is nothing to index.
    pub idle_delay: Duration,
    /// Average batch time above which the pause is doubled.
    pub slow_batch_threshold: Duration,
    pub max_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            confirmation_depth: 12,
            steady_batch_size: 100,
            medium_batch_size: 500,
            max_batch_size: 2_000,
            medium_lag_threshold: 1_000,
            large_lag_threshold: 10_000,
            base_delay: Duration::from_millis(1_000),
            idle_delay: Duration::from_millis(3_000),
            slow_batch_threshold: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

/// A range chosen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedBatch {
    pub range: BlockRange,
    /// Tier size that was selected (the range may be shorter near the head).
    pub size: u64,
    pub lag: u64,
}

pub struct BatchScheduler {
    config: SchedulerConfig,
    avg_batch_ms: f64,
    batches: u64,
}

impl BatchScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            avg_batch_ms: 0.0,
            batches: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Highest block that may be indexed given the current head.
    pub fn safe_head(&self, head: u64) -> u64 {
        head.saturating_sub(self.config.confirmation_depth)
    }

    pub fn lag(&self, last_indexed: u64, head: u64) -> u64 {
        self.safe_head(head).saturating_sub(last_indexed)
    }

    pub fn batch_size_for_lag(&self, lag: u64) -> u64 {
        let c = &self.config;
        if lag > c.large_lag_threshold {
            c.max_batch_size
        } else if lag > c.medium_lag_threshold {
            c.medium_batch_size
        } else {
            c.steady_batch_size
        }
    }

    /// The next range to process, or `None` when caught up.
    pub fn next_range(&self, last_indexed: u64, head: u64) -> Option<PlannedBatch> {
        let lag = self.lag(last_indexed, head);
        if lag == 0 {
            return None;
        }
        let size = self.batch_size_for_lag(lag).max(1);
        let from = last_indexed.saturating_add(1);
        let to = from
            .saturating_add(size - 1)
            .min(self.safe_head(head));
        Some(PlannedBatch {
            range: BlockRange::new(from, to),
            size,
            lag,
        })
    }

    /// Fold a completed batch's wall time into the moving average.
    pub fn record_batch_duration(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        self.avg_batch_ms = self.avg_batch_ms * (1.0 - EWMA_ALPHA) + ms * EWMA_ALPHA;
        self.batches += 1;
    }

    pub fn average_batch_ms(&self) -> f64 {
        self.avg_batch_ms
    }

    pub fn batches_recorded(&self) -> u64 {
        self.batches
    }

    /// Pause before the next batch.
    ///
    /// Doubles when the average batch is slow, and doubles again per
    /// consecutive failure (up to 2^5), capped at `max_delay`.
    pub fn inter_batch_delay(&self, consecutive_failures: u32) -> Duration {
        let mut delay = self.config.base_delay;
        if self.avg_batch_ms > self.config.slow_batch_threshold.as_secs_f64() * 1_000.0 {
            delay = delay.saturating_mul(2);
        }
        if consecutive_failures > 0 {
            let factor = 1u32 << consecutive_failures.min(MAX_FAILURE_EXPONENT);
            delay = delay.saturating_mul(factor);
        }
        delay.min(self.config.max_delay)
    }

    pub fn idle_delay(&self) -> Duration {
        self.config.idle_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> BatchScheduler {
        BatchScheduler::new(SchedulerConfig::default())
    }

    #[test]
    fn tiers_follow_lag() {
        let s = scheduler();
        assert_eq!(s.batch_size_for_lag(50), 100);
        assert_eq!(s.batch_size_for_lag(5_000), 500);
        assert_eq!(s.batch_size_for_lag(50_000), 2_000);
        // thresholds are exclusive
        assert_eq!(s.batch_size_for_lag(1_000), 100);
        assert_eq!(s.batch_size_for_lag(10_000), 500);
    }

    #[test]
    fn next_range_uses_tier_from_real_lag() {
        let s = scheduler();
        // head 1_062, last 1_000, depth 12 → lag 50
        let b = s.next_range(1_000, 1_062).unwrap();
        assert_eq!(b.lag, 50);
        assert_eq!(b.size, 100);
        assert_eq!(b.range, BlockRange::new(1_001, 1_050));

        // lag 5_000
        let b = s.next_range(1_000, 6_012).unwrap();
        assert_eq!(b.size, 500);
        assert_eq!(b.range, BlockRange::new(1_001, 1_500));

        // lag 50_000
        let b = s.next_range(1_000, 51_012).unwrap();
        assert_eq!(b.size, 2_000);
        assert_eq!(b.range, BlockRange::new(1_001, 3_000));
    }

    #[test]
    fn caught_up_returns_none() {
        let s = scheduler();
        assert!(s.next_range(1_000, 1_012).is_none());
        assert!(s.next_range(1_000, 1_005).is_none());
        assert!(s.next_range(1_000, 0).is_none());
    }

    #[test]
    fn cold_start_first_range() {
        let s = scheduler();
        let h = 5_000_000;
        let b = s.next_range(h - 1, h + 500).unwrap();
        assert_eq!(b.range, BlockRange::new(h, h + 99));
    }

    #[test]
    fn moving_average_is_exponential() {
        let mut s = scheduler();
        s.record_batch_duration(Duration::from_millis(1_000));
        assert!((s.average_batch_ms() - 100.0).abs() < 1e-6);
        s.record_batch_duration(Duration::from_millis(1_000));
        assert!((s.average_batch_ms() - 190.0).abs() < 1e-6);
        assert_eq!(s.batches_recorded(), 2);
    }

    #[test]
    fn delay_grows_when_slow_and_failing() {
        let mut s = scheduler();
        assert_eq!(s.inter_batch_delay(0), Duration::from_secs(1));

        for _ in 0..100 {
            s.record_batch_duration(Duration::from_secs(20));
        }
        assert_eq!(s.inter_batch_delay(0), Duration::from_secs(2));
        assert_eq!(s.inter_batch_delay(1), Duration::from_secs(4));
        assert_eq!(s.inter_batch_delay(3), Duration::from_secs(16));
        // capped
        assert_eq!(s.inter_batch_delay(20), Duration::from_secs(30));
    }
}
