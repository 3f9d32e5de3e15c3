//! HTTP API ingress.
//!
//! The axum surface in front of the gate and pipeline. Handlers are thin:
//! auth and parsing here, then straight into [`sprint_gate`] and
//! [`sprint_pipeline`]. Cache hits are served from the handler without
//! touching a lane.

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod ws;

pub use error::ApiError;

use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use sprint_cache::PredictiveCache;
use sprint_crypto::EntropyGenerator;
use sprint_fanout::Fanout;
use sprint_gate::TenantGate;
use sprint_pipeline::Dispatcher;
use sprint_relay::Relay;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Shared state for every handler.
pub struct GatewayContext {
    pub gate: Arc<TenantGate>,
    pub dispatcher: Arc<Dispatcher>,
    pub cache: Arc<PredictiveCache>,
    pub relay: Arc<Relay>,
    pub fanout: Arc<Fanout>,
    pub entropy: Arc<EntropyGenerator>,
    pub started_at: Instant,
    pub version: &'static str,
}

/// Extract the presented API key from `Authorization: Bearer` or
/// `X-API-Key`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Build the router over a shared context.
pub fn router(ctx: Arc<GatewayContext>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/status", get(handlers::status))
        .route("/v1/universal/:chain/:method", post(handlers::universal))
        .route("/v1/blocks/latest", get(handlers::latest_block))
        .route("/v1/subscribe", get(ws::subscribe))
        .route("/metrics", get(handlers::prometheus))
        .route("/v1/entropy/:level", post(handlers::entropy))
        .route("/v1/cache/stats", get(handlers::cache_stats))
        .route("/v1/tenants/:id/quota", get(handlers::tenant_quota))
        .with_state(ctx)
}

/// Errors from running the server itself.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Maps to exit code 3.
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: std::io::Error },

    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve(
    ctx: Arc<GatewayContext>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;
    info!(%addr, "api listening");
    axum::serve(listener, router(ctx)).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-sprint-123"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-sprint-123"));
    }

    #[test]
    fn test_extract_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-sprint-456"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("sk-sprint-456"));
    }

    #[test]
    fn test_bearer_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer first"));
        headers.insert("x-api-key", HeaderValue::from_static("second"));
        assert_eq!(extract_api_key(&headers).as_deref(), Some("first"));
    }

    #[test]
    fn test_missing_or_malformed_key() {
        let headers = HeaderMap::new();
        assert_eq!(extract_api_key(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(extract_api_key(&headers), None);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(extract_api_key(&headers), None);
    }
}
