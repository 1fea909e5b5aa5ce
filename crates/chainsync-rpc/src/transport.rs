//! The `RpcTransport` trait: one upstream JSON-RPC endpoint.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// A single endpoint. Retry, failover and health tracking live in the pool,
/// so implementations only move bytes.
///
/// Object-safe; stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// The transport's identifier (URL or name).
    fn url(&self) -> &str;
}

/// Call `method` on `transport` and deserialize the result.
pub async fn call_method<T: DeserializeOwned>(
    transport: &dyn RpcTransport,
    id: u64,
    method: &str,
    params: Vec<Value>,
) -> Result<T, TransportError> {
    let resp = transport.send(JsonRpcRequest::new(id, method, params)).await?;
    let result = resp
        .into_result()
        .map_err(|e| TransportError::from_rpc(transport.url(), e))?;
    serde_json::from_value(result).map_err(TransportError::Deserialization)
}
