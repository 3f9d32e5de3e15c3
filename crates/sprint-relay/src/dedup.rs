//! Cross-peer block deduplication.
//!
//! A bounded ring of recently seen hashes plus an index over them. The
//! first observer wins and publishes; later observers only bump the
//! published event's observation counter. Entries age out when the ring
//! evicts them, which re-opens the hash for publication (by then the dedup
//! window has long moved past it).

use sprint_core::{BlockHash, ObservationCounter, PeerId};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// What a peer's delivery of a hash amounted to.
#[derive(Debug)]
pub enum Observation {
    /// First delivery: publish. The counter travels with the event.
    First { observations: ObservationCounter },
    /// Seen before inside the window: drop, counter already bumped.
    Duplicate { observations: u32, first_peer: PeerId },
}

struct DedupEntry {
    first_peer: PeerId,
    #[allow(dead_code)]
    detected_at: Instant,
    observations: ObservationCounter,
}

/// Ring of the last `capacity` observed hashes with an index.
pub struct DedupWindow {
    capacity: usize,
    ring: VecDeque<BlockHash>,
    entries: HashMap<BlockHash, DedupEntry>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    /// Record a delivery of `hash` by `peer`.
    pub fn observe(&mut self, hash: BlockHash, peer: PeerId, now: Instant) -> Observation {
        if let Some(entry) = self.entries.get(&hash) {
            let observations = entry.observations.record();
            return Observation::Duplicate { observations, first_peer: entry.first_peer };
        }

        if self.ring.len() == self.capacity {
            if let Some(evicted) = self.ring.pop_front() {
                self.entries.remove(&evicted);
            }
        }

        let observations = ObservationCounter::new(1);
        self.ring.push_back(hash);
        self.entries.insert(
            hash,
            DedupEntry { first_peer: peer, detected_at: now, observations: observations.clone() },
        );
        Observation::First { observations }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Observation count for a hash still inside the window.
    pub fn observations(&self, hash: &BlockHash) -> Option<u32> {
        self.entries.get(hash).map(|e| e.observations.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> BlockHash {
        [n; 32]
    }

    #[test]
    fn test_first_writer_wins() {
        let mut window = DedupWindow::new(16);
        let now = Instant::now();

        let first = window.observe(hash(1), PeerId(0), now);
        assert!(matches!(first, Observation::First { .. }));

        match window.observe(hash(1), PeerId(1), now) {
            Observation::Duplicate { observations, first_peer } => {
                assert_eq!(observations, 2);
                assert_eq!(first_peer, PeerId(0));
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[test]
    fn test_published_counter_tracks_duplicates() {
        let mut window = DedupWindow::new(16);
        let now = Instant::now();

        let Observation::First { observations } = window.observe(hash(1), PeerId(0), now) else {
            panic!("expected first");
        };
        window.observe(hash(1), PeerId(1), now);
        window.observe(hash(1), PeerId(2), now);

        // The counter handed out at publication reflects later deliveries.
        assert_eq!(observations.get(), 3);
    }

    #[test]
    fn test_distinct_hashes_both_publish() {
        let mut window = DedupWindow::new(16);
        let now = Instant::now();
        assert!(matches!(window.observe(hash(1), PeerId(0), now), Observation::First { .. }));
        assert!(matches!(window.observe(hash(2), PeerId(0), now), Observation::First { .. }));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_ring_eviction_reopens_hash() {
        let mut window = DedupWindow::new(2);
        let now = Instant::now();
        window.observe(hash(1), PeerId(0), now);
        window.observe(hash(2), PeerId(0), now);
        window.observe(hash(3), PeerId(0), now);

        assert_eq!(window.len(), 2);
        assert!(window.observations(&hash(1)).is_none(), "oldest aged out");
        // Aged-out hash republishes; correct for a window long past it.
        assert!(matches!(window.observe(hash(1), PeerId(1), now), Observation::First { .. }));
    }

    #[test]
    fn test_exactly_one_publication_per_hash() {
        let mut window = DedupWindow::new(2048);
        let now = Instant::now();
        let mut publications = 0;
        for peer in 0..5u16 {
            if matches!(window.observe(hash(42), PeerId(peer), now), Observation::First { .. }) {
                publications += 1;
            }
        }
        assert_eq!(publications, 1);
        assert_eq!(window.observations(&hash(42)), Some(5));
    }
}
