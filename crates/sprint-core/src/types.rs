//! Normalized event shapes published by the chain relays.

use crate::chain::ChainId;
use crate::tier::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 32-byte block hash, normalized across chains.
pub type BlockHash = [u8; 32];

/// 32-byte transaction id.
pub type TxId = [u8; 32];

/// Stable per-peer identifier, assigned at startup in config order.
///
/// Lower ids win dedup tie-breaks, so the config order of endpoints is the
/// preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u16);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Shared observation counter attached to a published [`BlockEvent`].
///
/// The event is published on the first observation; peers that deliver the
/// same block later bump this counter through the dedup window, so
/// consumers holding the event see the up-to-date count.
#[derive(Debug, Clone, Default)]
pub struct ObservationCounter(Arc<AtomicU32>);

impl ObservationCounter {
    pub fn new(initial: u32) -> Self {
        Self(Arc::new(AtomicU32::new(initial)))
    }

    pub fn record(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for ObservationCounter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.get())
    }
}

impl<'de> Deserialize<'de> for ObservationCounter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::new(u32::deserialize(deserializer)?))
    }
}

fn instant_now() -> Instant {
    Instant::now()
}

/// A new-block observation, normalized across chains and deduplicated
/// across peers.
///
/// Invariant: `(chain, hash)` is unique within the chain's dedup window;
/// `detected_at` is the earliest observation across peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    pub chain: ChainId,
    #[serde(with = "hex_hash")]
    pub hash: BlockHash,
    pub height: u64,
    /// Monotonic observation instant, for latency accounting. Not on the wire.
    #[serde(skip, default = "instant_now")]
    pub detected_at: Instant,
    pub wall_time: DateTime<Utc>,
    pub source_peer: PeerId,
    pub tier_observed: Tier,
    pub relay_latency: Duration,
    /// How many peers have delivered this block so far.
    pub peer_observations: ObservationCounter,
}

/// A mempool transaction observation.
///
/// Invariant: `(chain, txid)` unique within the TTL window; entries age out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MempoolEntry {
    pub chain: ChainId,
    #[serde(with = "hex_hash")]
    pub txid: TxId,
    pub size_bytes: u32,
    pub priority: u64,
    pub fee_rate: u64,
    pub first_seen: DateTime<Utc>,
}

/// Parse a 32-byte hash from a hex string, with or without `0x` prefix.
pub fn parse_hash32(s: &str) -> Option<BlockHash> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() != 64 {
        return None;
    }
    let bytes = hex::decode(s).ok()?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Some(out)
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(hash)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_hash32(&s).ok_or_else(|| serde::de::Error::custom("expected 32-byte hex hash"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hash32() {
        let h = "0x".to_string() + &"ab".repeat(32);
        let parsed = parse_hash32(&h).unwrap();
        assert_eq!(parsed[0], 0xab);

        assert!(parse_hash32("0x1234").is_none());
        assert!(parse_hash32(&"zz".repeat(32)).is_none());
    }

    #[test]
    fn test_observation_counter_shared() {
        let counter = ObservationCounter::new(1);
        let clone = counter.clone();
        clone.record();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_block_event_wire_format() {
        let event = BlockEvent {
            chain: ChainId::Ethereum,
            hash: [0x11; 32],
            height: 100,
            detected_at: Instant::now(),
            wall_time: Utc::now(),
            source_peer: PeerId(0),
            tier_observed: Tier::Turbo,
            relay_latency: Duration::from_millis(3),
            peer_observations: ObservationCounter::new(2),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["chain"], "ethereum");
        assert_eq!(json["height"], 100);
        assert_eq!(json["peer_observations"], 2);
        assert_eq!(json["hash"], format!("0x{}", "11".repeat(32)));
    }
}
