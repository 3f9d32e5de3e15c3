//! Chain health snapshots.
//!
//! Peer tasks rebuild the snapshot on every state change; readers clone an
//! `Arc` out of the slot and never block the hot path.

use crate::peer::{PeerHandle, PeerState};
use serde::Serialize;
use sprint_core::{BreakerState, ChainId};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct PeerHealth {
    pub endpoint: String,
    pub state: PeerState,
    pub circuit: String,
    /// Milliseconds since the peer last delivered anything.
    pub last_heard_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
    pub reputation: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainHealth {
    pub chain: ChainId,
    pub synced: bool,
    pub height: Option<u64>,
    pub peers: Vec<PeerHealth>,
}

impl ChainHealth {
    pub fn empty(chain: ChainId) -> Self {
        Self { chain, synced: false, height: None, peers: Vec::new() }
    }

    /// Build a snapshot from current peer bookkeeping.
    pub fn snapshot(chain: ChainId, peers: &[std::sync::Arc<PeerHandle>], height: Option<u64>) -> Self {
        let peer_health: Vec<PeerHealth> = peers
            .iter()
            .map(|p| PeerHealth {
                endpoint: p.config.url.clone(),
                state: p.state(),
                circuit: breaker_str(p.breaker.state()),
                last_heard_ms: p.last_heard().map(|t| t.elapsed().as_millis() as u64),
                p95_latency_ms: p.p95_latency().map(|d| d.as_millis() as u64),
                reputation: p.reputation(),
            })
            .collect();

        // Synced = at least one live peer heard from recently.
        let synced = peers.iter().any(|p| {
            p.state().is_connected()
                && p.last_heard().is_some_and(|t| t.elapsed() < Duration::from_secs(120))
        });

        Self { chain, synced, height, peers: peer_health }
    }

    /// Whether every peer's circuit is open: a full-chain outage.
    pub fn all_circuits_open(&self) -> bool {
        !self.peers.is_empty() && self.peers.iter().all(|p| p.circuit == "open")
    }
}

fn breaker_str(state: BreakerState) -> String {
    match state {
        BreakerState::Closed => "closed",
        BreakerState::Open => "open",
        BreakerState::HalfOpen => "half_open",
    }
    .to_string()
}
