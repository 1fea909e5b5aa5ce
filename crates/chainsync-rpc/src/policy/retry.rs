//! Doubling backoff between failover attempts inside one pool call.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first, each on the next eligible endpoint.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Pause before retry number `attempt` (1-based): `initial · 2^(attempt-1)`
    /// capped at `max_backoff`. `None` once the retries are used up.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let factor = 1u32 << (attempt - 1).min(20);
        Some(
            self.config
                .initial_backoff
                .saturating_mul(factor)
                .min(self.config.max_backoff),
        )
    }
}
