//! Failure controller: consecutive-error tracking, failover and backoff.

use std::time::Duration;

use tracing::warn;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureConfig {
    /// Consecutive batch failures before forcing a provider rotation.
    pub failover_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            failover_threshold: 15,
            base_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

/// Counts consecutive batch failures.
///
/// Repeated failure is treated as a provider-health problem: once the
/// threshold is reached the caller rotates providers and acknowledges it,
/// which resets the counter.
pub struct FailureController {
    config: FailureConfig,
    consecutive: u32,
    total: u64,
    failovers: u64,
}

impl FailureController {
    pub fn new(config: FailureConfig) -> Self {
        Self {
            config,
            consecutive: 0,
            total: 0,
            failovers: 0,
        }
    }

    pub fn record_failure(&mut self, err: &SyncError) {
        self.consecutive = self.consecutive.saturating_add(1);
        self.total += 1;
        warn!(
            consecutive = self.consecutive,
            kind = err.kind(),
            error = %err,
            "batch failed"
        );
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn should_failover(&self) -> bool {
        self.consecutive >= self.config.failover_threshold
    }

    /// Call after the provider rotation has been performed.
    pub fn acknowledge_failover(&mut self) {
        self.consecutive = 0;
        self.failovers += 1;
    }

    /// `base * 2^(n-1)` for `n` consecutive failures, capped.
    pub fn backoff_delay(&self) -> Duration {
        if self.consecutive == 0 {
            return Duration::ZERO;
        }
        let exp = (self.consecutive - 1).min(16);
        self.config
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.config.max_backoff)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn total_failures(&self) -> u64 {
        self.total
    }

    pub fn failovers(&self) -> u64 {
        self.failovers
    }
}

/// The scheduler's and the controller's delays are independent; the larger wins.
pub fn combined_delay(scheduler_delay: Duration, backoff: Duration) -> Duration {
    scheduler_delay.max(backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SyncError {
        SyncError::Transport("timeout".into())
    }

    #[test]
    fn failover_after_threshold_then_reset() {
        let mut fc = FailureController::new(FailureConfig {
            failover_threshold: 3,
            ..Default::default()
        });
        fc.record_failure(&transport());
        fc.record_failure(&transport());
        assert!(!fc.should_failover());
        fc.record_failure(&transport());
        assert!(fc.should_failover());

        fc.acknowledge_failover();
        assert!(!fc.should_failover());
        assert_eq!(fc.consecutive_failures(), 0);
        assert_eq!(fc.failovers(), 1);
        assert_eq!(fc.total_failures(), 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut fc = FailureController::new(FailureConfig::default());
        assert_eq!(fc.backoff_delay(), Duration::ZERO);
        fc.record_failure(&transport());
        assert_eq!(fc.backoff_delay(), Duration::from_secs(1));
        fc.record_failure(&transport());
        assert_eq!(fc.backoff_delay(), Duration::from_secs(2));
        fc.record_failure(&transport());
        assert_eq!(fc.backoff_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            fc.record_failure(&transport());
        }
        assert_eq!(fc.backoff_delay(), Duration::from_secs(30));

        fc.record_success();
        assert_eq!(fc.backoff_delay(), Duration::ZERO);
    }

    #[test]
    fn larger_delay_wins() {
        assert_eq!(
            combined_delay(Duration::from_secs(2), Duration::from_secs(8)),
            Duration::from_secs(8)
        );
        assert_eq!(
            combined_delay(Duration::from_secs(5), Duration::ZERO),
            Duration::from_secs(5)
        );
    }
}
