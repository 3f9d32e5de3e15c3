//! Request handlers.

use crate::error::ApiError;
use crate::{extract_api_key, GatewayContext};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use sprint_cache::{AccessPredictor, AccessState, CacheOutcome};
use sprint_core::{adapter_for, ChainId, ErrorKind, Fingerprint};
use sprint_crypto::{EntropyLevel, SecureBuffer};
use sprint_pipeline::DispatchRequest;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

fn parse_chain(raw: &str) -> Result<ChainId, ApiError> {
    ChainId::from_str(raw).map_err(|e| ApiError(ErrorKind::bad_request(e.to_string())))
}

/// GET /health — liveness plus a summary.
pub async fn health(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    let mut chains = serde_json::Map::new();
    for chain in ctx.relay.configured_chains() {
        if let Ok(health) = ctx.relay.health(chain) {
            chains.insert(
                chain.to_string(),
                json!({
                    "synced": health.synced,
                    "height": health.height,
                    "peers": health.peers.len(),
                }),
            );
        }
    }
    let cache = ctx.cache.totals();
    Json(json!({
        "status": "ok",
        "version": ctx.version,
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "chains": chains,
        "cache": {
            "entries": cache.entries,
            "hit_rate": cache.hit_rate(),
            "in_flight": cache.in_flight,
        },
        "entropy_sources": ctx.entropy.available_sources(),
    }))
}

/// GET /status — detailed per-chain state.
pub async fn status(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    let mut chains = Vec::new();
    for chain in ctx.relay.configured_chains() {
        if let Ok(health) = ctx.relay.health(chain) {
            chains.push(serde_json::to_value(&*health).unwrap_or(Value::Null));
        }
    }
    Json(json!({
        "chains": chains,
        "lanes": ctx.dispatcher.lane_depths(),
        "shed_level": format!("{:?}", ctx.gate.shed_level()),
        "subscribers": ctx.fanout.subscriber_count(),
    }))
}

/// POST /v1/universal/{chain}/{method} — chain-agnostic request path.
pub async fn universal(
    State(ctx): State<Arc<GatewayContext>>,
    Path((chain, method)): Path<(String, String)>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = parse_chain(&chain)?;
    let key = extract_api_key(&headers);
    let admission = ctx.gate.admit(key.as_deref(), Some(chain), Some(&method))?;

    let params = body.map(|Json(v)| v).unwrap_or(Value::Array(vec![]));
    let adapter = adapter_for(chain);
    let params = adapter.normalize_request(&method, &params)?;
    let fingerprint = Fingerprint::compute(admission.class, chain, &method, &params);
    let source_height = adapter.extract_height(&method, &params);

    // Feed the pattern predictor; a confident prediction pre-warms in the
    // background at Pro priority.
    let observed = AccessState::new(&method, &params);
    if let Some(predicted) = ctx.cache.observe_access(admission.class, observed) {
        if let Some((p_method, p_params)) =
            AccessPredictor::actionable_request(&predicted, source_height)
        {
            let dispatcher = Arc::clone(&ctx.dispatcher);
            tokio::spawn(async move {
                dispatcher.dispatch_speculative(chain, p_method, p_params).await;
            });
        }
    }

    // Cache hits are served right here; only misses enter the pipeline.
    let started = Instant::now();
    let (result, cache_hit) = match ctx.cache.get(&fingerprint) {
        CacheOutcome::Hit(payload) => (Ok(payload), true),
        _ => {
            let outcome = ctx
                .dispatcher
                .dispatch(DispatchRequest {
                    chain,
                    method: method.clone(),
                    params,
                    fingerprint,
                    class: admission.class,
                    tier: admission.tier,
                    deadline: admission.deadline,
                    speculative: false,
                    ttl: None,
                    source_height,
                    co_fingerprints: Vec::new(),
                })
                .await;
            (outcome, false)
        }
    };

    let outcome_tag = match &result {
        Ok(_) => "ok",
        Err(err) => err.tag(),
    };
    ctx.gate.log_request(
        &admission.tenant_id,
        chain,
        &method,
        cache_hit,
        started.elapsed(),
        outcome_tag,
    );

    let payload = result?;
    Ok(([(header::CONTENT_TYPE, "application/json")], payload))
}

#[derive(Debug, Deserialize)]
pub struct LatestBlockQuery {
    pub chain: String,
}

/// GET /v1/blocks/latest?chain= — latest header, served from the relay.
pub async fn latest_block(
    State(ctx): State<Arc<GatewayContext>>,
    Query(query): Query<LatestBlockQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let chain = parse_chain(&query.chain)?;
    let latest = ctx.relay.latest_block(chain)?;
    match latest {
        Some(event) => Ok(Json(serde_json::to_value(&event).unwrap_or(Value::Null))),
        None => Err(ApiError(ErrorKind::upstream("no block observed yet"))),
    }
}

/// GET /metrics — Prometheus text exposition.
pub async fn prometheus(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    let body = crate::metrics::render(&ctx);
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[derive(Debug, Deserialize)]
pub struct EntropyBody {
    #[serde(default = "default_entropy_bytes")]
    pub bytes: usize,
}

fn default_entropy_bytes() -> usize {
    32
}

const MAX_ENTROPY_BYTES: usize = 1024;

/// POST /v1/entropy/{fast|hybrid|enterprise} — N bytes of entropy.
/// Authenticated; the enterprise level requires the Enterprise tier.
pub async fn entropy(
    State(ctx): State<Arc<GatewayContext>>,
    Path(level): Path<String>,
    headers: HeaderMap,
    body: Option<Json<EntropyBody>>,
) -> Result<impl IntoResponse, ApiError> {
    let level = EntropyLevel::from_str(&level)
        .map_err(|e| ApiError(ErrorKind::bad_request(e)))?;
    let key = extract_api_key(&headers);
    let admission = ctx.gate.admit(key.as_deref(), None, Some("entropy"))?;

    if level == EntropyLevel::Enterprise && !admission.tier.allows_enterprise_entropy() {
        return Err(ApiError(ErrorKind::unsupported(
            "enterprise entropy requires the enterprise tier",
        )));
    }

    let requested = body.map(|Json(b)| b.bytes).unwrap_or_else(default_entropy_bytes);
    if requested == 0 || requested > MAX_ENTROPY_BYTES {
        return Err(ApiError(ErrorKind::bad_request(format!(
            "bytes must be 1..={MAX_ENTROPY_BYTES}"
        ))));
    }

    let mut buffer = SecureBuffer::new(requested)
        .map_err(|e| ApiError(ErrorKind::upstream(e.to_string())))?;
    ctx.entropy.fill_random(level, &mut buffer)?;
    let encoded = buffer.expose(|bytes| hex::encode(bytes));

    Ok(Json(json!({
        "level": level.as_str(),
        "bytes": requested,
        "entropy": encoded,
    })))
}

/// GET /v1/cache/stats — hit/miss/size per shard.
pub async fn cache_stats(State(ctx): State<Arc<GatewayContext>>) -> impl IntoResponse {
    let totals = ctx.cache.totals();
    Json(json!({
        "totals": totals,
        "hit_rate": totals.hit_rate(),
        "shards": ctx.cache.shard_stats(),
    }))
}

/// GET /v1/tenants/{id}/quota — remaining quota.
pub async fn tenant_quota(
    State(ctx): State<Arc<GatewayContext>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match ctx.gate.quota_status(&id) {
        Some((remaining, limit)) => Ok(Json(json!({
            "tenant_id": id,
            "quota_remaining": remaining,
            "quota_monthly_limit": limit,
        }))),
        None => Err(ApiError(ErrorKind::bad_request(format!("unknown tenant: {id}")))),
    }
}
