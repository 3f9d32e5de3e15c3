//! Streaming subscriptions over WebSocket.
//!
//! `GET /v1/subscribe` upgrades to a WS session fed by the fan-out.
//! Authentication is either a tenant API key or, for internal peers, an
//! HMAC handshake over (nonce, timestamp) passed as query parameters.

use crate::error::ApiError;
use crate::{extract_api_key, GatewayContext};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use serde::Deserialize;
use sprint_core::{ChainId, ErrorKind};
use sprint_fanout::{Delivery, SubscriptionFilter};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeQuery {
    /// Comma-separated chain list; empty means all.
    #[serde(default)]
    pub chains: Option<String>,
    #[serde(default)]
    pub min_height: Option<u64>,
    #[serde(default)]
    pub mempool: Option<bool>,
    /// Resume cursor: `chain:seq` pairs, comma-separated.
    #[serde(default)]
    pub resume: Option<String>,
    /// Peer handshake fields (hex nonce + tag).
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub ts: Option<i64>,
    #[serde(default)]
    pub tag: Option<String>,
}

fn parse_filter(query: &SubscribeQuery) -> Result<SubscriptionFilter, ErrorKind> {
    let mut filter = SubscriptionFilter::default();
    if let Some(raw) = &query.chains {
        for part in raw.split(',').filter(|s| !s.is_empty()) {
            let chain = ChainId::from_str(part).map_err(|e| ErrorKind::bad_request(e.to_string()))?;
            filter.chains.insert(chain);
        }
    }
    filter.min_height = query.min_height;
    filter.include_mempool = query.mempool.unwrap_or(false);
    Ok(filter)
}

fn parse_resume(raw: Option<&str>) -> Result<HashMap<ChainId, u64>, ErrorKind> {
    let mut resume = HashMap::new();
    let Some(raw) = raw else { return Ok(resume) };
    for pair in raw.split(',').filter(|s| !s.is_empty()) {
        let (chain, seq) = pair
            .split_once(':')
            .ok_or_else(|| ErrorKind::bad_request(format!("bad resume cursor: {pair}")))?;
        let chain = ChainId::from_str(chain).map_err(|e| ErrorKind::bad_request(e.to_string()))?;
        let seq: u64 =
            seq.parse().map_err(|_| ErrorKind::bad_request(format!("bad sequence: {seq}")))?;
        resume.insert(chain, seq);
    }
    Ok(resume)
}

/// Authenticate the subscriber: peer handshake when handshake fields are
/// present, tenant key otherwise. Returns the subscriber's display name
/// and whether mempool streaming is allowed.
fn authenticate(
    ctx: &GatewayContext,
    headers: &HeaderMap,
    query: &SubscribeQuery,
) -> Result<(String, bool), ErrorKind> {
    if let (Some(nonce), Some(ts), Some(tag)) = (&query.nonce, query.ts, &query.tag) {
        let nonce = hex::decode(nonce).map_err(|_| ErrorKind::bad_request("bad nonce hex"))?;
        let tag = hex::decode(tag).map_err(|_| ErrorKind::bad_request("bad tag hex"))?;
        ctx.gate.verify_peer_handshake(&nonce, ts, &tag)?;
        return Ok(("peer".to_string(), true));
    }

    let key = extract_api_key(headers);
    let admission = ctx.gate.admit(key.as_deref(), None, Some("subscribe"))?;
    let mempool_ok = admission.tier.allows_mempool_stream();
    Ok((admission.tenant_id, mempool_ok))
}

/// GET /v1/subscribe — upgrade to a streaming session.
pub async fn subscribe(
    State(ctx): State<Arc<GatewayContext>>,
    Query(query): Query<SubscribeQuery>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let (subscriber, mempool_allowed) = authenticate(&ctx, &headers, &query)?;
    let mut filter = parse_filter(&query)?;
    if filter.include_mempool && !mempool_allowed {
        return Err(ApiError(ErrorKind::unsupported(
            "mempool streaming requires the pro tier or above",
        )));
    }
    let resume = parse_resume(query.resume.as_deref())?;

    Ok(upgrade.on_upgrade(move |socket| session(ctx, socket, subscriber, filter, resume)))
}

async fn session(
    ctx: Arc<GatewayContext>,
    mut socket: WebSocket,
    subscriber: String,
    filter: SubscriptionFilter,
    resume: HashMap<ChainId, u64>,
) {
    let (id, mut deliveries) = ctx.fanout.subscribe(&subscriber, filter, resume);
    debug!(subscription = %id, subscriber, "ws session open");

    loop {
        tokio::select! {
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else {
                    // Fan-out dropped us (lagged) or shut down.
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                let text = match serde_json::to_string(&delivery) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "delivery serialization failed");
                        continue;
                    }
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {} // inbound data is ignored
                    Some(Err(_)) => break,
                }
            }
        }
    }

    ctx.fanout.unsubscribe(&id);
    debug!(subscription = %id, "ws session closed");
}
