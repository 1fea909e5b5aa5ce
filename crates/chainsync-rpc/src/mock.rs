//! Scripted in-process transport for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::TransportError;
use crate::request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::transport::RpcTransport;

type Responder = Box<dyn Fn(&JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> + Send + Sync>;

pub struct ScriptedTransport {
    url: String,
    calls: AtomicUsize,
    respond: Responder,
}

impl ScriptedTransport {
    pub fn new(
        url: &str,
        respond: impl Fn(&JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            calls: AtomicUsize::new(0),
            respond: Box::new(respond),
        })
    }

    /// Answers every call with `"0x10"`.
    pub fn healthy(url: &str) -> Arc<Self> {
        Self::new(url, |req| Ok(reply(req, json!("0x10"))))
    }

    pub fn failing(url: &str) -> Arc<Self> {
        Self::new(url, |_| Err(TransportError::Http("connection refused".into())))
    }

    pub fn rate_limited(url: &str) -> Arc<Self> {
        Self::new(url, |req| Ok(error(req, -32005, "daily request count exceeded")))
    }

    pub fn reverting(url: &str) -> Arc<Self> {
        Self::new(url, |req| Ok(error(req, 3, "execution reverted")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn reply(req: &JsonRpcRequest, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        id: req.id.clone(),
        result: Some(result),
        error: None,
    }
}

fn error(req: &JsonRpcRequest, code: i64, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        id: req.id.clone(),
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }),
    }
}

#[async_trait]
impl RpcTransport for ScriptedTransport {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(&req)
    }

    fn url(&self) -> &str {
        &self.url
    }
}
