//! Subscriber fan-out.
//!
//! Delivers deduplicated block events (and optionally mempool entries)
//! from the event bus to long-lived subscribers. Per chain, a subscriber
//! sees heights monotonically non-decreasing with a per-chain sequence
//! number; a reconnecting subscriber can resume from its last sequence out
//! of the retention ring. Slow subscribers are dropped, never the events.

pub mod filter;

pub use filter::SubscriptionFilter;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sprint_core::{BlockEvent, ChainId, MempoolEntry};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a subscriber receives.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    Block { seq: u64, event: BlockEvent },
    Mempool { entry: MempoolEntry },
}

/// Fan-out sizing.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Events retained per chain for resume-after-reconnect.
    pub retention: usize,
    /// Bounded queue per subscriber; overflow drops the subscriber.
    pub subscriber_queue: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self { retention: 256, subscriber_queue: 64 }
    }
}

struct Subscription {
    id: Uuid,
    tenant: String,
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Delivery>,
}

#[derive(Default)]
pub struct FanoutMetrics {
    pub delivered: AtomicU64,
    pub filtered: AtomicU64,
    pub lagged_drops: AtomicU64,
}

impl FanoutMetrics {
    pub fn export(&self) -> String {
        format!(
            r#"# HELP sprint_fanout_delivered_total Events delivered to subscribers
# TYPE sprint_fanout_delivered_total counter
sprint_fanout_delivered_total {}

# HELP sprint_fanout_filtered_total Events suppressed by subscription filters
# TYPE sprint_fanout_filtered_total counter
sprint_fanout_filtered_total {}

# HELP sprint_fanout_lagged_drops_total Subscribers dropped for lagging
# TYPE sprint_fanout_lagged_drops_total counter
sprint_fanout_lagged_drops_total {}
"#,
            self.delivered.load(Ordering::Relaxed),
            self.filtered.load(Ordering::Relaxed),
            self.lagged_drops.load(Ordering::Relaxed),
        )
    }
}

/// The fan-out stage.
pub struct Fanout {
    config: FanoutConfig,
    /// Per-chain retention ring of (seq, event).
    retention: Mutex<HashMap<ChainId, VecDeque<(u64, BlockEvent)>>>,
    /// Per-chain sequence counters.
    sequences: DashMap<ChainId, AtomicU64>,
    subscriptions: DashMap<Uuid, Arc<Subscription>>,
    pub metrics: FanoutMetrics,
}

impl Fanout {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            config,
            retention: Mutex::new(HashMap::new()),
            sequences: DashMap::new(),
            subscriptions: DashMap::new(),
            metrics: FanoutMetrics::default(),
        }
    }

    /// Register a subscriber. `resume_from` maps chain to the last
    /// sequence already seen; buffered events after it are replayed.
    pub fn subscribe(
        &self,
        tenant: &str,
        filter: SubscriptionFilter,
        resume_from: HashMap<ChainId, u64>,
    ) -> (Uuid, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue);
        let id = Uuid::new_v4();
        let subscription =
            Arc::new(Subscription { id, tenant: tenant.to_string(), filter, tx });

        // Replay the retention ring before new events interleave.
        {
            let retention = self.retention.lock();
            for (chain, last_seq) in &resume_from {
                if let Some(ring) = retention.get(chain) {
                    for (seq, event) in ring.iter() {
                        if *seq > *last_seq && subscription.filter.matches_block(event) {
                            // Queue capacity bounds replay; a subscriber that
                            // cannot absorb the backlog starts lagged.
                            let _ = subscription
                                .tx
                                .try_send(Delivery::Block { seq: *seq, event: event.clone() });
                        }
                    }
                }
            }
        }

        info!(subscription = %id, tenant, "subscriber registered");
        self.subscriptions.insert(id, subscription);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        if self.subscriptions.remove(id).is_some() {
            debug!(subscription = %id, "subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Ingest one deduplicated block event. Called from the per-chain pump
    /// task, so per-chain ordering is preserved.
    pub fn ingest_block(&self, event: BlockEvent) {
        let seq = self
            .sequences
            .entry(event.chain)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1;

        {
            let mut retention = self.retention.lock();
            let ring = retention.entry(event.chain).or_default();
            if ring.len() == self.config.retention {
                ring.pop_front();
            }
            ring.push_back((seq, event.clone()));
        }

        let mut lagged: Vec<Uuid> = Vec::new();
        for entry in self.subscriptions.iter() {
            let sub = entry.value();
            if !sub.filter.matches_block(&event) {
                self.metrics.filtered.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            match sub.tx.try_send(Delivery::Block { seq, event: event.clone() }) {
                Ok(()) => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // The slowest subscriber is dropped, not the events.
                    warn!(subscription = %sub.id, tenant = %sub.tenant, "subscriber lagged, dropping");
                    lagged.push(sub.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    lagged.push(sub.id);
                }
            }
        }
        for id in lagged {
            self.metrics.lagged_drops.fetch_add(1, Ordering::Relaxed);
            self.subscriptions.remove(&id);
        }
    }

    /// Ingest one mempool entry. No retention; best-effort streaming.
    pub fn ingest_mempool(&self, entry: MempoolEntry) {
        let mut lagged: Vec<Uuid> = Vec::new();
        for sub_entry in self.subscriptions.iter() {
            let sub = sub_entry.value();
            if !sub.filter.matches_mempool(&entry) {
                continue;
            }
            match sub.tx.try_send(Delivery::Mempool { entry: entry.clone() }) {
                Ok(()) => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => lagged.push(sub.id),
                Err(mpsc::error::TrySendError::Closed(_)) => lagged.push(sub.id),
            }
        }
        for id in lagged {
            self.metrics.lagged_drops.fetch_add(1, Ordering::Relaxed);
            self.subscriptions.remove(&id);
        }
    }

    /// Pump one chain's block bus into the fan-out until the bus closes.
    pub async fn run_block_pump(self: Arc<Self>, mut events: broadcast::Receiver<BlockEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.ingest_block(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "fanout lagged behind event bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Pump one chain's mempool bus.
    pub async fn run_mempool_pump(self: Arc<Self>, mut entries: broadcast::Receiver<MempoolEntry>) {
        loop {
            match entries.recv().await {
                Ok(entry) => self.ingest_mempool(entry),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "mempool fanout lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
