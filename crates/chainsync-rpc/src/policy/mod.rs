//! Reliability policies applied by the pool.
//!
//! ```text
//! invoke → [weighted pick among closed circuits] → [Transport]
//!             ↑                                        │ transient error
//!             └──────── [RetryPolicy delay] ←──────────┘
//! ```

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryConfig, RetryPolicy};
