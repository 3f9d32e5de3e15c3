//! Per-peer connection state and bookkeeping.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sprint_core::{BreakerConfig, CircuitBreaker, EndpointConfig, PeerId};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::warn;

/// Connection lifecycle:
///
/// ```text
/// Disconnected -> Connecting -> Handshaking -> Subscribed -> {Idle <-> Receiving}
///                                                                 | failure
///                                                              Draining -> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Subscribed,
    Idle,
    Receiving,
    Draining,
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Subscribed | PeerState::Idle | PeerState::Receiving)
    }
}

/// Malformed messages allowed per minute before the peer is demoted.
const ERROR_BUDGET_PER_MINUTE: usize = 100;
/// Latency samples kept for the p95 estimate.
const LATENCY_SAMPLES: usize = 64;
/// Consecutive connect failures that open the peer circuit.
const CONNECT_FAILURE_THRESHOLD: u32 = 5;
/// Receive errors inside 60 s that open the peer circuit.
const RECEIVE_ERROR_WINDOW_THRESHOLD: u32 = 10;

struct PeerStats {
    last_heard: Option<Instant>,
    latencies: VecDeque<Duration>,
    reputation: u8,
    successful_requests: u64,
    failed_requests: u64,
    malformed: VecDeque<Instant>,
}

/// One upstream endpoint of one chain.
pub struct PeerHandle {
    pub id: PeerId,
    pub config: EndpointConfig,
    state: RwLock<PeerState>,
    pub breaker: CircuitBreaker,
    stats: Mutex<PeerStats>,
}

impl PeerHandle {
    pub fn new(id: PeerId, config: EndpointConfig) -> Self {
        let breaker = CircuitBreaker::new(
            BreakerConfig::new(&format!("{}:{}", id, config.url))
                .with_failure_threshold(CONNECT_FAILURE_THRESHOLD)
                .with_window(RECEIVE_ERROR_WINDOW_THRESHOLD, Duration::from_secs(60))
                .with_open_duration(Duration::from_secs(1)),
        );
        Self {
            id,
            config,
            state: RwLock::new(PeerState::Disconnected),
            breaker,
            stats: Mutex::new(PeerStats {
                last_heard: None,
                latencies: VecDeque::with_capacity(LATENCY_SAMPLES),
                reputation: 100,
                successful_requests: 0,
                failed_requests: 0,
                malformed: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> PeerState {
        *self.state.read()
    }

    pub fn set_state(&self, state: PeerState) {
        *self.state.write() = state;
    }

    /// Record that the peer delivered something (message or pong).
    pub fn record_heard(&self) {
        let mut stats = self.stats.lock();
        stats.last_heard = Some(Instant::now());
    }

    pub fn record_success(&self, latency: Duration) {
        self.breaker.record_success();
        let mut stats = self.stats.lock();
        stats.last_heard = Some(Instant::now());
        stats.successful_requests += 1;
        stats.reputation = (stats.reputation + 1).min(100);
        if stats.latencies.len() == LATENCY_SAMPLES {
            stats.latencies.pop_front();
        }
        stats.latencies.push_back(latency);
    }

    pub fn record_failure(&self) {
        self.breaker.record_failure();
        let mut stats = self.stats.lock();
        stats.failed_requests += 1;
        stats.reputation = stats.reputation.saturating_sub(5);
    }

    /// Count a malformed message. The message itself is dropped; a peer
    /// that exceeds its budget is demoted to Open.
    pub fn record_malformed(&self) {
        let now = Instant::now();
        let exceeded = {
            let mut stats = self.stats.lock();
            stats.malformed.push_back(now);
            while let Some(front) = stats.malformed.front() {
                if now.duration_since(*front) > Duration::from_secs(60) {
                    stats.malformed.pop_front();
                } else {
                    break;
                }
            }
            stats.malformed.len() > ERROR_BUDGET_PER_MINUTE
        };
        if exceeded {
            warn!(peer = %self.id, url = %self.config.url, "error budget exceeded, demoting");
            self.breaker.trip();
        }
    }

    pub fn last_heard(&self) -> Option<Instant> {
        self.stats.lock().last_heard
    }

    pub fn reputation(&self) -> u8 {
        self.stats.lock().reputation
    }

    /// 95th percentile of recent request latencies.
    pub fn p95_latency(&self) -> Option<Duration> {
        let stats = self.stats.lock();
        if stats.latencies.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = stats.latencies.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() * 95).div_ceil(100).saturating_sub(1);
        Some(sorted[idx])
    }

    pub fn request_counts(&self) -> (u64, u64) {
        let stats = self.stats.lock();
        (stats.successful_requests, stats.failed_requests)
    }

    /// Routing preference: connected first, then reputation, then latency.
    pub fn routing_score(&self) -> (bool, u8, Duration) {
        (
            self.state().is_connected(),
            self.reputation(),
            self.p95_latency().unwrap_or(Duration::from_secs(1)),
        )
    }
}

/// Reconnect delay for the given attempt: exponential from 1 s, ±25%
/// jitter. Normally capped at 32 s; an endpoint that keeps failing while a
/// sibling peer is healthy backs off up to 256 s instead.
pub fn backoff_delay(attempt: u32, sibling_healthy: bool) -> Duration {
    const BASE_SECS: u64 = 1;
    const CAP_SECS: u64 = 32;
    const PROBLEM_CAP_SECS: u64 = 256;
    const PROBLEM_ATTEMPTS: u32 = 6;

    let cap = if sibling_healthy && attempt >= PROBLEM_ATTEMPTS { PROBLEM_CAP_SECS } else { CAP_SECS };
    let exp = BASE_SECS.saturating_mul(1u64 << attempt.min(10)).min(cap);
    let jitter = 0.75 + rand::random::<f64>() * 0.5;
    Duration::from_millis(((exp * 1000) as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprint_core::BreakerState;

    fn peer() -> PeerHandle {
        PeerHandle::new(PeerId(0), EndpointConfig::ws("ws://example.test"))
    }

    #[test]
    fn test_state_transitions() {
        let p = peer();
        assert_eq!(p.state(), PeerState::Disconnected);
        p.set_state(PeerState::Connecting);
        p.set_state(PeerState::Handshaking);
        p.set_state(PeerState::Subscribed);
        assert!(p.state().is_connected());
        p.set_state(PeerState::Draining);
        assert!(!p.state().is_connected());
    }

    #[test]
    fn test_five_connect_failures_open_circuit() {
        let p = peer();
        for _ in 0..4 {
            p.record_failure();
        }
        assert_eq!(p.breaker.state(), BreakerState::Closed);
        p.record_failure();
        assert_eq!(p.breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_error_budget_demotes() {
        let p = peer();
        for _ in 0..=ERROR_BUDGET_PER_MINUTE {
            p.record_malformed();
        }
        assert_eq!(p.breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_reputation_moves() {
        let p = peer();
        p.record_failure();
        assert_eq!(p.reputation(), 95);
        for _ in 0..10 {
            p.record_success(Duration::from_millis(5));
        }
        assert_eq!(p.reputation(), 100);
    }

    #[test]
    fn test_p95_latency() {
        let p = peer();
        for ms in 1..=100u64 {
            p.record_success(Duration::from_millis(ms));
        }
        // Only the last 64 samples (37..=100 ms) are retained.
        let p95 = p.p95_latency().unwrap();
        assert!(p95 >= Duration::from_millis(95), "p95 was {p95:?}");
    }

    #[test]
    fn test_backoff_schedule() {
        for attempt in 0..12 {
            let d = backoff_delay(attempt, false);
            assert!(d >= Duration::from_millis(750), "attempt {attempt}: {d:?}");
            assert!(d <= Duration::from_secs(40), "attempt {attempt}: {d:?}");
        }
        // Problematic endpoint with a healthy sibling may back off further.
        let d = backoff_delay(10, true);
        assert!(d <= Duration::from_millis((256_000f64 * 1.25) as u64 + 1));
    }
}
