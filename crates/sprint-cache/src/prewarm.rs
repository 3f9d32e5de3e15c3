//! Cache pre-warming.
//!
//! Two predictors feed speculative fetches:
//! - the sequence predictor fires on every new head and prefetches the
//!   next blocks with cheap metadata-only requests;
//! - the access-pattern predictor (see [`crate::predictor`]) fires when a
//!   tenant class's request stream becomes predictable.
//!
//! The same loop performs reorg invalidation: a new head makes every cache
//! entry inside the reorg window suspect.

use crate::PredictiveCache;
use async_trait::async_trait;
use serde_json::Value;
use sprint_core::{adapter_for, BlockEvent, ChainId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Issues speculative requests on behalf of the pre-warmer. Implemented by
/// the node wiring as a pipeline submission at Pro lane priority.
#[async_trait]
pub trait Prefetcher: Send + Sync {
    async fn prefetch(&self, chain: ChainId, method: String, params: Value);
}

/// How many blocks past the head the sequence predictor reaches.
const SEQUENCE_LOOKAHEAD: u64 = 2;

/// Event-driven cache maintenance: sequence prefetch + reorg invalidation.
pub struct Prewarmer {
    cache: Arc<PredictiveCache>,
    prefetcher: Arc<dyn Prefetcher>,
}

impl Prewarmer {
    pub fn new(cache: Arc<PredictiveCache>, prefetcher: Arc<dyn Prefetcher>) -> Self {
        Self { cache, prefetcher }
    }

    /// Consume block events until the bus closes.
    pub async fn run(self, mut events: broadcast::Receiver<BlockEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_head(&event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Pre-warming is best-effort; skipping heads only costs
                    // warmth, never correctness.
                    warn!(skipped, "prewarmer lagged behind event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_head(&self, event: &BlockEvent) {
        let adapter = adapter_for(event.chain);

        let invalidated =
            self.cache.invalidate_by_height(event.chain, event.height, adapter.reorg_depth());
        if invalidated > 0 {
            debug!(chain = %event.chain, height = event.height, invalidated, "reorg window invalidated");
        }

        for offset in 1..=SEQUENCE_LOOKAHEAD {
            let (method, params) = adapter.prefetch_request(event.height + offset);
            self.prefetcher.prefetch(event.chain, method, params).await;
        }
    }
}
