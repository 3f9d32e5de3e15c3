//! Upstream I/O: JSON-RPC over HTTP for queries and polling, WebSocket
//! connect helper for subscriptions.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use sprint_core::EndpointConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Errors from a single upstream request attempt.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Request/reply seam to upstream nodes. The production implementation is
/// [`HttpUpstreamClient`]; tests stub this to script upstream behavior.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn request(
        &self,
        endpoint: &EndpointConfig,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 over HTTP via a shared connection pool.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpUpstreamClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .unwrap_or_default();
        Self { client, next_id: AtomicU64::new(1) }
    }
}

impl Default for HttpUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn request(
        &self,
        endpoint: &EndpointConfig,
        method: &str,
        params: &Value,
        timeout: Duration,
    ) -> Result<Value, UpstreamError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});

        let mut request = self.client.post(&endpoint.url).json(&body).timeout(timeout);
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout
            } else {
                UpstreamError::Transport(e.to_string())
            }
        })?;

        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(UpstreamError::Rpc { code: error.code, message: error.message });
        }
        parsed.result.ok_or_else(|| UpstreamError::Malformed("missing result".to_string()))
    }
}

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket to `endpoint`, applying its header decorations.
pub async fn ws_connect(endpoint: &EndpointConfig) -> Result<WsStream, UpstreamError> {
    let mut request = endpoint
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;

    for (name, value) in &endpoint.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| UpstreamError::Transport(e.to_string()))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _) = connect_async(request)
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_response_parsing() {
        let ok: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"number":"0x64"}}"#).unwrap();
        assert!(ok.result.is_some());
        assert!(ok.error.is_none());

        let err: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .unwrap();
        assert_eq!(err.error.unwrap().code, -32601);
    }
}
