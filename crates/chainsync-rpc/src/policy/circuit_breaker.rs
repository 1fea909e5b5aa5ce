//! Per-endpoint circuit breaker.
//!
//! ```text
//! Closed ──(failure_threshold consecutive failures)──▶ Open
//!   ▲                                                  │ cooldown elapsed
//!   └──────(trial succeeds)──── HalfOpen ◀─────────────┘
//!                                  │ trial fails
//!                                  └──────────────────▶ Open
//! ```
//!
//! A half-open circuit admits one trial call at a time. If the trial never
//! reports back (its caller was dropped), another is admitted once a full
//! cooldown has passed.
//!
//! [`CircuitBreaker::force_open`] skips the count; the pool uses it when the
//! sync loop asks to rotate away from the current endpoint.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Externally visible breaker state, reported in provider health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects traffic before admitting a trial call.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 8,
            cooldown: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed,
    Open { since: Instant },
    /// `trial` is when the in-flight trial call was admitted.
    HalfOpen { trial: Option<Instant> },
}

#[derive(Debug)]
struct Tally {
    phase: Phase,
    failures: u32,
}

/// Circuit breaker guarding one upstream endpoint.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    tally: Mutex<Tally>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            tally: Mutex::new(Tally {
                phase: Phase::Closed,
                failures: 0,
            }),
        }
    }

    /// Lock the tally, moving an expired open circuit to half-open.
    fn tally(&self) -> MutexGuard<'_, Tally> {
        let mut t = self.tally.lock().unwrap_or_else(PoisonError::into_inner);
        if let Phase::Open { since } = t.phase {
            if since.elapsed() >= self.config.cooldown {
                t.phase = Phase::HalfOpen { trial: None };
                info!(failures = t.failures, "circuit half-open");
            }
        }
        t
    }

    fn trial_free(&self, trial: Option<Instant>) -> bool {
        trial.map_or(true, |at| at.elapsed() >= self.config.cooldown)
    }

    /// Current state. An open circuit whose cooldown has run out reports
    /// (and becomes) half-open.
    pub fn state(&self) -> CircuitState {
        match self.tally().phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Whether a call could be admitted right now. Does not claim the
    /// half-open trial; see [`CircuitBreaker::try_acquire`].
    pub fn is_allowed(&self) -> bool {
        match self.tally().phase {
            Phase::Closed => true,
            Phase::Open { .. } => false,
            Phase::HalfOpen { trial } => self.trial_free(trial),
        }
    }

    /// Admit one call. In half-open this claims the single trial slot, and
    /// every other caller is refused until the trial reports back.
    pub fn try_acquire(&self) -> bool {
        let mut t = self.tally();
        let phase = t.phase;
        match phase {
            Phase::Closed => true,
            Phase::Open { .. } => false,
            Phase::HalfOpen { trial } => {
                if !self.trial_free(trial) {
                    return false;
                }
                t.phase = Phase::HalfOpen {
                    trial: Some(Instant::now()),
                };
                info!(failures = t.failures, "admitting a trial call");
                true
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.tally().failures
    }

    /// When an open circuit will admit a trial call. `None` unless open.
    pub fn open_until(&self) -> Option<Instant> {
        match self.tally().phase {
            Phase::Open { since } => Some(since + self.config.cooldown),
            _ => None,
        }
    }

    pub fn record_success(&self) {
        let mut t = self.tally();
        if matches!(t.phase, Phase::HalfOpen { .. }) {
            info!("trial call succeeded, circuit closed");
        }
        t.phase = Phase::Closed;
        t.failures = 0;
    }

    pub fn record_failure(&self) {
        let mut t = self.tally();
        t.failures = t.failures.saturating_add(1);
        let phase = t.phase;
        match phase {
            Phase::Closed if t.failures >= self.config.failure_threshold => {
                t.phase = Phase::Open { since: Instant::now() };
                warn!(failures = t.failures, "circuit opened");
            }
            Phase::HalfOpen { .. } => {
                t.phase = Phase::Open { since: Instant::now() };
                warn!(failures = t.failures, "trial call failed, circuit reopened");
            }
            _ => {}
        }
    }

    /// Open the circuit now, whatever the failure count.
    pub fn force_open(&self) {
        self.tally().phase = Phase::Open { since: Instant::now() };
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failures", &self.consecutive_failures())
            .finish()
    }
}
