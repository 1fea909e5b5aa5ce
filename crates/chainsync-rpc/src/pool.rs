//! Weighted multi-endpoint pool with per-endpoint circuit breakers.
//!
//! Selection is a smooth weighted round-robin over the endpoints whose
//! circuit currently admits traffic: an endpoint with weight 3 receives three
//! calls for every one sent to a weight-1 endpoint, interleaved rather than
//! in bursts. After a transient failure the retry prefers a different
//! endpoint than the one that just failed.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chainsync_core::config::RpcSection;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::http::HttpTransport;
use crate::policy::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryPolicy};
use crate::transport::{call_method, RpcTransport};

const NO_SLOT: usize = usize::MAX;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Applied to every endpoint independently.
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Timeout per individual request.
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn from_section(rpc: &RpcSection) -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: rpc.failure_threshold,
                cooldown: Duration::from_secs(rpc.cooldown_secs),
            },
            retry: RetryConfig {
                max_retries: rpc.max_retries,
                initial_backoff: Duration::from_millis(rpc.initial_backoff_ms),
                max_backoff: Duration::from_millis(rpc.max_backoff_ms),
            },
            request_timeout: Duration::from_secs(rpc.request_timeout_secs),
        }
    }
}

/// Point-in-time health of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderHealth {
    pub url: String,
    pub weight: u32,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
    pub circuit_open_until: Option<Instant>,
    pub total_requests: u64,
    pub total_failures: u64,
}

struct EndpointSlot {
    transport: Arc<dyn RpcTransport>,
    weight: u32,
    circuit: CircuitBreaker,
    requests: AtomicU64,
    failures: AtomicU64,
}

pub struct ChainClientPool {
    slots: Vec<EndpointSlot>,
    config: PoolConfig,
    retry: RetryPolicy,
    /// Smooth WRR running weights, one per slot.
    current_weights: Mutex<Vec<i64>>,
    last_used: AtomicUsize,
    next_id: AtomicU64,
}

impl ChainClientPool {
    /// Build a pool from `(transport, weight)` pairs.
    pub fn new(endpoints: Vec<(Arc<dyn RpcTransport>, u32)>, config: PoolConfig) -> Self {
        let slots: Vec<EndpointSlot> = endpoints
            .into_iter()
            .map(|(transport, weight)| EndpointSlot {
                transport,
                weight: weight.max(1),
                circuit: CircuitBreaker::new(config.circuit_breaker.clone()),
                requests: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            })
            .collect();
        let current_weights = Mutex::new(vec![0; slots.len()]);
        Self {
            slots,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            current_weights,
            last_used: AtomicUsize::new(NO_SLOT),
            next_id: AtomicU64::new(1),
        }
    }

    /// HTTP endpoints from the `rpc` config section.
    pub fn from_config(rpc: &RpcSection) -> Result<Self, TransportError> {
        let config = PoolConfig::from_section(rpc);
        let endpoints = rpc
            .endpoints
            .iter()
            .map(|ep| {
                let transport = HttpTransport::new(ep.url.clone(), config.request_timeout)?;
                Ok((Arc::new(transport) as Arc<dyn RpcTransport>, ep.weight))
            })
            .collect::<Result<Vec<_>, TransportError>>()?;
        Ok(Self::new(endpoints, config))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Pick the next endpoint among admitting circuits, skipping `avoid`
    /// when any alternative exists. A half-open pick claims that endpoint's
    /// single trial call.
    fn select(&self, avoid: Option<usize>) -> Option<usize> {
        // Held across the pick so two callers can't both claim one trial.
        let mut current = self
            .current_weights
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let allowed: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].circuit.is_allowed())
            .collect();
        let candidates: Vec<usize> = match avoid {
            Some(a) if allowed.len() > 1 => allowed.into_iter().filter(|&i| i != a).collect(),
            _ => allowed,
        };

        let mut total = 0i64;
        let mut best: Option<usize> = None;
        for &i in &candidates {
            let w = i64::from(self.slots[i].weight);
            current[i] += w;
            total += w;
            if best.map_or(true, |b| current[i] > current[b]) {
                best = Some(i);
            }
        }
        let best = best?;
        current[best] -= total;
        self.slots[best].circuit.try_acquire().then_some(best)
    }

    /// Call `method` on the best available endpoint, failing over to others
    /// on transient errors until the retry policy is exhausted.
    ///
    /// Node-side errors (reverts, bad params) are returned immediately and do
    /// not count against the endpoint.
    pub async fn invoke_with_failover<T>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, TransportError>
    where
        T: DeserializeOwned + Send,
    {
        let mut attempt = 0u32;
        let mut avoid = None;
        loop {
            let idx = self.select(avoid).ok_or(TransportError::AllProvidersDown)?;
            let slot = &self.slots[idx];
            self.last_used.store(idx, Ordering::Relaxed);
            slot.requests.fetch_add(1, Ordering::Relaxed);

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let timeout = self.config.request_timeout;
            let call = call_method::<T>(slot.transport.as_ref(), id, method, params.clone());
            let result = match tokio::time::timeout(timeout, call).await {
                Ok(r) => r,
                Err(_) => Err(TransportError::Timeout {
                    ms: timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(value) => {
                    slot.circuit.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() => {
                    slot.failures.fetch_add(1, Ordering::Relaxed);
                    slot.circuit.record_failure();
                    attempt += 1;
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            warn!(
                                attempt,
                                method,
                                url = slot.transport.url(),
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "endpoint failed, failing over"
                            );
                            avoid = Some(idx);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            warn!(
                                attempt,
                                method,
                                url = slot.transport.url(),
                                error = %e,
                                "retries exhausted"
                            );
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    // The node answered, so the endpoint itself is reachable.
                    slot.circuit.record_success();
                    return Err(e);
                }
            }
        }
    }

    /// Open the circuit of the most recently used endpoint so traffic moves
    /// elsewhere. A no-op with fewer than two endpoints.
    pub fn force_rotate(&self) {
        if self.slots.len() < 2 {
            warn!("single endpoint configured, nothing to rotate to");
            return;
        }
        let idx = self.last_used.load(Ordering::Relaxed);
        let Some(slot) = self.slots.get(idx) else {
            return;
        };
        slot.circuit.force_open();
        warn!(url = slot.transport.url(), "forced rotation away from endpoint");
        for h in self.health() {
            info!(
                url = %h.url,
                weight = h.weight,
                circuit = %h.circuit,
                consecutive_failures = h.consecutive_failures,
                requests = h.total_requests,
                failures = h.total_failures,
                "provider health"
            );
        }
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        self.slots
            .iter()
            .map(|s| ProviderHealth {
                url: s.transport.url().to_string(),
                weight: s.weight,
                consecutive_failures: s.circuit.consecutive_failures(),
                circuit: s.circuit.state(),
                circuit_open_until: s.circuit.open_until(),
                total_requests: s.requests.load(Ordering::Relaxed),
                total_failures: s.failures.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;

    fn config(threshold: u32, open: Duration, retries: u32) -> PoolConfig {
        PoolConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown: open,
            },
            retry: RetryConfig {
                max_retries: retries,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            request_timeout: Duration::from_secs(5),
        }
    }

    fn pool(endpoints: &[(&Arc<ScriptedTransport>, u32)], cfg: PoolConfig) -> ChainClientPool {
        ChainClientPool::new(
            endpoints
                .iter()
                .map(|(t, w)| (Arc::clone(*t) as Arc<dyn RpcTransport>, *w))
                .collect(),
            cfg,
        )
    }

    #[tokio::test]
    async fn weights_split_traffic() {
        let a = ScriptedTransport::healthy("https://a");
        let b = ScriptedTransport::healthy("https://b");
        let p = pool(&[(&a, 3), (&b, 1)], config(8, Duration::from_secs(15), 0));
        for _ in 0..8 {
            let v: String = p.invoke_with_failover("eth_blockNumber", vec![]).await.unwrap();
            assert_eq!(v, "0x10");
        }
        assert_eq!(a.calls(), 6);
        assert_eq!(b.calls(), 2);
    }

    #[tokio::test]
    async fn open_circuit_routes_elsewhere_until_cooldown() {
        let a = ScriptedTransport::failing("https://a");
        let b = ScriptedTransport::healthy("https://b");
        let p = pool(&[(&a, 1), (&b, 1)], config(3, Duration::from_millis(80), 1));

        for _ in 0..20 {
            let v: String = p.invoke_with_failover("eth_blockNumber", vec![]).await.unwrap();
            assert_eq!(v, "0x10");
        }
        // A took exactly `threshold` hits, then its circuit stayed open.
        assert_eq!(a.calls(), 3);
        let health = p.health();
        assert_eq!(health[0].circuit, CircuitState::Open);
        assert!(health[0].circuit_open_until.is_some());
        assert_eq!(health[0].total_failures, 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..2 {
            let _: String = p.invoke_with_failover("eth_blockNumber", vec![]).await.unwrap();
        }
        // one half-open trial call after the cooldown
        assert_eq!(a.calls(), 4);
        assert_eq!(p.health()[0].circuit, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_endpoint_takes_one_trial_at_a_time() {
        let a = ScriptedTransport::healthy("https://a");
        let b = ScriptedTransport::healthy("https://b");
        let p = pool(&[(&a, 100), (&b, 1)], config(8, Duration::from_millis(30), 0));
        let _: String = p.invoke_with_failover("eth_blockNumber", vec![]).await.unwrap();
        p.force_rotate();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(p.health()[0].circuit, CircuitState::HalfOpen);

        // While the trial is outstanding every other pick goes to B.
        assert_eq!(p.select(None), Some(0));
        for _ in 0..5 {
            assert_eq!(p.select(None), Some(1));
        }
        p.slots[0].circuit.record_success();
        assert_eq!(p.health()[0].circuit, CircuitState::Closed);
        assert_eq!(p.select(None), Some(0));
    }

    #[tokio::test]
    async fn all_circuits_open_surfaces_error() {
        let a = ScriptedTransport::failing("https://a");
        let p = pool(&[(&a, 1)], config(1, Duration::from_secs(60), 3));
        let err = p
            .invoke_with_failover::<String>("eth_blockNumber", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::AllProvidersDown));
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_response_fails_over() {
        let a = ScriptedTransport::rate_limited("https://a");
        let b = ScriptedTransport::healthy("https://b");
        let p = pool(&[(&a, 5), (&b, 1)], config(8, Duration::from_secs(15), 2));
        let v: String = p.invoke_with_failover("eth_blockNumber", vec![]).await.unwrap();
        assert_eq!(v, "0x10");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(p.health()[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn node_errors_are_not_retried() {
        let a = ScriptedTransport::reverting("https://a");
        let b = ScriptedTransport::healthy("https://b");
        let p = pool(&[(&a, 1), (&b, 1)], config(8, Duration::from_secs(15), 3));
        let err = p
            .invoke_with_failover::<String>("eth_call", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rpc(_)));
        assert_eq!(b.calls(), 0);
        assert_eq!(p.health()[0].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn force_rotate_opens_last_used() {
        let a = ScriptedTransport::healthy("https://a");
        let b = ScriptedTransport::healthy("https://b");
        let p = pool(&[(&a, 1), (&b, 1)], config(8, Duration::from_secs(60), 0));

        let _: String = p.invoke_with_failover("eth_blockNumber", vec![]).await.unwrap();
        assert_eq!(a.calls(), 1);
        p.force_rotate();
        assert_eq!(p.health()[0].circuit, CircuitState::Open);

        for _ in 0..4 {
            let _: String = p.invoke_with_failover("eth_blockNumber", vec![]).await.unwrap();
        }
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 4);
    }

    #[test]
    fn force_rotate_single_endpoint_is_noop() {
        let a = ScriptedTransport::healthy("https://a");
        let p = pool(&[(&a, 1)], PoolConfig::default());
        p.force_rotate();
        assert_eq!(p.health()[0].circuit, CircuitState::Closed);
    }
}
