//! chainsync-rpc — upstream chain access for ChainSync.
//!
//! - [`RpcTransport`] — one JSON-RPC endpoint ([`HttpTransport`] over reqwest)
//! - [`ChainClientPool`] — weighted round-robin across endpoints, a circuit
//!   breaker per endpoint, failover with an explicit [`RetryPolicy`]
//! - [`ChainClient`] — height, block and log reads used by the sync loop
//! - [`TransportError`] — structured error type

pub mod client;
pub mod error;
pub mod http;
pub mod policy;
pub mod pool;
pub mod request;
pub mod transport;

#[cfg(test)]
mod mock;

pub use client::ChainClient;
pub use error::TransportError;
pub use http::HttpTransport;
pub use policy::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryPolicy};
pub use pool::{ChainClientPool, PoolConfig, ProviderHealth};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, LogFilter, RpcId};
pub use transport::{call_method, RpcTransport};
