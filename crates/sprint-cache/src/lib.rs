//! Predictive cache.
//!
//! A sharded LRU+TTL map keyed by request fingerprint, with single-flight
//! coalescing and pre-warming. Lookup and insert are sub-millisecond: one
//! lock per shard, no cross-shard coordination, and payloads are shared
//! `Bytes` so a hit never copies.

pub mod flight;
pub mod predictor;
pub mod prewarm;
pub mod shard;

pub use flight::{ClaimGuard, ClaimResult, Waiter};
pub use predictor::{AccessPredictor, AccessState, ParamClass};
pub use prewarm::{Prefetcher, Prewarmer};
pub use shard::{CacheEntry, ShardStats};

use bytes::Bytes;
use flight::FlightTable;
use shard::Shard;
use sprint_core::{ChainId, Fingerprint};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache sizing and expiry knobs.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Shard count; must be a power of two.
    pub shards: usize,
    pub max_entries_per_shard: usize,
    pub default_ttl: Duration,
    /// Background sweep cadence per shard.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: 32,
            max_entries_per_shard: 4096,
            default_ttl: Duration::from_secs(12),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of a cache lookup.
pub enum CacheOutcome {
    Hit(Bytes),
    Miss,
    /// Another request for the same fingerprint is already upstream.
    InFlight(Waiter),
}

/// Sharded LRU+TTL cache with single-flight coalescing.
pub struct PredictiveCache {
    config: CacheConfig,
    shards: Vec<Shard>,
    flights: Arc<FlightTable>,
    predictor: AccessPredictor,
}

impl PredictiveCache {
    pub fn new(config: CacheConfig) -> Self {
        assert!(config.shards.is_power_of_two(), "shard count must be a power of two");
        let shards = (0..config.shards).map(|_| Shard::new(config.max_entries_per_shard)).collect();
        Self { config, shards, flights: Arc::new(FlightTable::new()), predictor: AccessPredictor::new() }
    }

    fn shard(&self, fp: &Fingerprint) -> &Shard {
        &self.shards[fp.shard_index(self.shards.len())]
    }

    /// Look up a fingerprint: `Hit` with the payload, `Miss`, or
    /// `InFlight` with a waiter on the ongoing fetch.
    pub fn get(&self, fp: &Fingerprint) -> CacheOutcome {
        if let Some(entry) = self.shard(fp).get(fp, Instant::now()) {
            return CacheOutcome::Hit(entry.payload);
        }
        match self.flights.waiter(fp) {
            Some(waiter) => CacheOutcome::InFlight(waiter),
            None => CacheOutcome::Miss,
        }
    }

    /// Insert a payload, overwriting any prior entry for the fingerprint.
    pub fn put(
        &self,
        fp: Fingerprint,
        chain: ChainId,
        payload: Bytes,
        ttl: Option<Duration>,
        source_height: Option<u64>,
        speculative: bool,
    ) {
        let now = Instant::now();
        let entry = CacheEntry {
            payload,
            chain,
            inserted_at: now,
            expires_at: now + ttl.unwrap_or(self.config.default_ttl),
            source_height,
            speculative,
        };
        self.shard(&fp).put(fp, entry);
    }

    /// Atomically claim the in-flight slot for `fp`.
    pub fn claim(&self, fp: Fingerprint) -> ClaimResult {
        self.flights.claim(fp)
    }

    /// Remove entries for `chain` inside the reorg window of `new_height`.
    pub fn invalidate_by_height(&self, chain: ChainId, new_height: u64, reorg_depth: u64) -> usize {
        let removed: usize = self
            .shards
            .iter()
            .map(|s| s.invalidate_by_height(chain, new_height, reorg_depth))
            .sum();
        if removed > 0 {
            debug!(%chain, new_height, removed, "height invalidation");
        }
        removed
    }

    /// Purge expired entries across all shards. Returns entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.shards.iter().map(|s| s.sweep(now)).sum()
    }

    /// Record an access for the pattern predictor; returns a predicted
    /// next state when confidence clears the threshold.
    pub fn observe_access(
        &self,
        class: sprint_core::TierClass,
        state: AccessState,
    ) -> Option<AccessState> {
        self.predictor.observe(class, state)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn in_flight_count(&self) -> usize {
        self.flights.in_flight_count()
    }

    /// Per-shard statistics snapshot.
    pub fn shard_stats(&self) -> Vec<ShardStats> {
        self.shards.iter().map(|s| s.stats()).collect()
    }

    /// Aggregate hit/miss totals.
    pub fn totals(&self) -> CacheTotals {
        let mut totals = CacheTotals::default();
        for stats in self.shard_stats() {
            totals.entries += stats.entries;
            totals.hits += stats.hits;
            totals.misses += stats.misses;
            totals.evictions += stats.evictions + stats.speculative_evictions;
            totals.expired += stats.expired;
        }
        totals.in_flight = self.in_flight_count();
        totals
    }

    /// Spawn the cooperative TTL sweeper. Runs until the cache is dropped
    /// by every holder.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                let swept = cache.sweep();
                if swept > 0 {
                    debug!(swept, "ttl sweep");
                }
            }
        })
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheTotals {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
    pub in_flight: usize,
}

impl CacheTotals {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
