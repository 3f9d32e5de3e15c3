//! A single cache shard: an LRU map with TTL expiry layered on top.
//!
//! Operations within a shard are serialized behind one lock; shards never
//! talk to each other, so cross-shard operations run concurrently.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use sprint_core::{ChainId, Fingerprint};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A cached response payload.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Bytes,
    pub chain: ChainId,
    pub inserted_at: Instant,
    pub expires_at: Instant,
    /// Height the payload was derived from, when height-addressed.
    pub source_height: Option<u64>,
    /// Pre-warmed entries are evicted before demand-filled ones.
    pub speculative: bool,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Per-shard counters. Relaxed ordering: these feed monitoring only.
#[derive(Debug, Default)]
pub struct ShardCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub expired: AtomicU64,
    pub evictions: AtomicU64,
    pub speculative_evictions: AtomicU64,
    pub inserts: AtomicU64,
    pub invalidations: AtomicU64,
}

/// Point-in-time snapshot for the stats API.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ShardStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evictions: u64,
    pub speculative_evictions: u64,
    pub inserts: u64,
    pub invalidations: u64,
}

pub struct Shard {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    counters: ShardCounters,
    capacity: usize,
}

impl Shard {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            counters: ShardCounters::default(),
            capacity: capacity.max(1),
        }
    }

    /// Look up a fingerprint. Expired entries are purged on sight and
    /// reported as misses — an expired entry is never returned.
    pub fn get(&self, fp: &Fingerprint, now: Instant) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();
        let found = entries.get(fp).map(|entry| (entry.is_expired(now), entry.clone()));
        match found {
            Some((false, entry)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some((true, _)) => {
                entries.pop(fp);
                self.counters.expired.fetch_add(1, Ordering::Relaxed);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert, overwriting any prior entry. When the shard is full a
    /// speculative entry is sacrificed before a demand-filled one.
    pub fn put(&self, fp: Fingerprint, entry: CacheEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity && !entries.contains(&fp) {
            // iter() walks MRU -> LRU, so the last speculative entry seen
            // is the least-recently-used one.
            let victim = entries
                .iter()
                .filter(|(_, e)| e.speculative)
                .map(|(k, _)| *k)
                .last();
            if let Some(victim) = victim {
                entries.pop(&victim);
                self.counters.speculative_evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        if entries.len() == self.capacity && !entries.contains(&fp) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.put(fp, entry);
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove entries for `chain` still inside the reorg window of
    /// `new_height`. Entries older than `new_height - reorg_depth` are
    /// stable and survive.
    pub fn invalidate_by_height(&self, chain: ChainId, new_height: u64, reorg_depth: u64) -> usize {
        let stable_below = new_height.saturating_sub(reorg_depth);
        let mut entries = self.entries.lock();
        let victims: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| {
                e.chain == chain && e.source_height.is_some_and(|h| h > stable_below)
            })
            .map(|(k, _)| *k)
            .collect();
        for fp in &victims {
            entries.pop(fp);
        }
        self.counters.invalidations.fetch_add(victims.len() as u64, Ordering::Relaxed);
        victims.len()
    }

    /// Drop expired entries. Called by the background sweeper.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let victims: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        for fp in &victims {
            entries.pop(fp);
        }
        self.counters.expired.fetch_add(victims.len() as u64, Ordering::Relaxed);
        victims.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            entries: self.len(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            speculative_evictions: self.counters.speculative_evictions.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::from_raw([n; 32])
    }

    fn entry(chain: ChainId, ttl: Duration, height: Option<u64>, speculative: bool) -> CacheEntry {
        let now = Instant::now();
        CacheEntry {
            payload: Bytes::from_static(b"payload"),
            chain,
            inserted_at: now,
            expires_at: now + ttl,
            source_height: height,
            speculative,
        }
    }

    #[test]
    fn test_put_get_roundtrip() {
        let shard = Shard::new(8);
        shard.put(fp(1), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));
        assert!(shard.get(&fp(1), Instant::now()).is_some());
        assert!(shard.get(&fp(2), Instant::now()).is_none());

        let stats = shard.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_expired_never_returned() {
        let shard = Shard::new(8);
        shard.put(fp(1), entry(ChainId::Bitcoin, Duration::from_millis(1), None, false));
        let later = Instant::now() + Duration::from_millis(10);
        assert!(shard.get(&fp(1), later).is_none());
        // The expired entry was purged on access.
        assert_eq!(shard.len(), 0);
        assert_eq!(shard.stats().expired, 1);
    }

    #[test]
    fn test_speculative_evicted_first() {
        let shard = Shard::new(3);
        shard.put(fp(1), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));
        shard.put(fp(2), entry(ChainId::Bitcoin, Duration::from_secs(60), None, true));
        shard.put(fp(3), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));

        // Touch the speculative entry so it is NOT the LRU.
        assert!(shard.get(&fp(2), Instant::now()).is_some());

        shard.put(fp(4), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));
        assert!(shard.get(&fp(2), Instant::now()).is_none(), "speculative goes first");
        assert!(shard.get(&fp(1), Instant::now()).is_some());
        assert!(shard.get(&fp(3), Instant::now()).is_some());
        assert_eq!(shard.stats().speculative_evictions, 1);
    }

    #[test]
    fn test_lru_eviction_when_no_speculative() {
        let shard = Shard::new(2);
        shard.put(fp(1), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));
        shard.put(fp(2), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));
        shard.get(&fp(1), Instant::now());
        shard.put(fp(3), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));

        assert!(shard.get(&fp(2), Instant::now()).is_none(), "LRU entry evicted");
        assert!(shard.get(&fp(1), Instant::now()).is_some());
        assert_eq!(shard.stats().evictions, 1);
    }

    #[test]
    fn test_invalidate_by_height_is_depth_exact() {
        let shard = Shard::new(16);
        for height in 95..=100u64 {
            shard.put(
                fp(height as u8),
                entry(ChainId::Bitcoin, Duration::from_secs(60), Some(height), false),
            );
        }
        // Entry on another chain at an affected height must survive.
        shard.put(fp(200), entry(ChainId::Ethereum, Duration::from_secs(60), Some(100), false));

        let removed = shard.invalidate_by_height(ChainId::Bitcoin, 100, 2);
        assert_eq!(removed, 2, "only heights 99 and 100 are inside the reorg window");

        assert!(shard.get(&fp(98), Instant::now()).is_some());
        assert!(shard.get(&fp(99), Instant::now()).is_none());
        assert!(shard.get(&fp(100), Instant::now()).is_none());
        assert!(shard.get(&fp(200), Instant::now()).is_some());
    }

    #[test]
    fn test_sweep_purges_only_expired() {
        let shard = Shard::new(8);
        shard.put(fp(1), entry(ChainId::Bitcoin, Duration::from_millis(1), None, false));
        shard.put(fp(2), entry(ChainId::Bitcoin, Duration::from_secs(60), None, false));

        let swept = shard.sweep(Instant::now() + Duration::from_millis(10));
        assert_eq!(swept, 1);
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_overwrite_same_fingerprint() {
        let shard = Shard::new(2);
        shard.put(fp(1), entry(ChainId::Bitcoin, Duration::from_secs(60), Some(1), false));
        let mut updated = entry(ChainId::Bitcoin, Duration::from_secs(60), Some(2), false);
        updated.payload = Bytes::from_static(b"updated");
        shard.put(fp(1), updated);

        let got = shard.get(&fp(1), Instant::now()).unwrap();
        assert_eq!(&got.payload[..], b"updated");
        assert_eq!(shard.len(), 1);
    }
}
