//! Circuit breaker shared by relay peers and the dispatch pipeline.
//!
//! Three states:
//! - Closed: normal operation, requests pass through
//! - Open: failure budget exceeded, requests fail fast until cool-down
//! - HalfOpen: one probe window to test recovery
//!
//! Trips on either consecutive failures or too many failures inside a
//! rolling window. Transitions are deterministic and observable via
//! [`CircuitBreaker::stats`].

use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before opening.
    pub failure_threshold: u32,
    /// Failures within `window` that also open the circuit.
    pub window_failure_threshold: u32,
    /// Rolling window length for `window_failure_threshold`.
    pub window: Duration,
    /// How long the circuit stays open before a half-open probe.
    pub open_duration: Duration,
    /// Successes in half-open required to close.
    pub success_threshold: u32,
    /// Name for logging.
    pub name: String,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_failure_threshold: 10,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            success_threshold: 3,
            name: "default".to_string(),
        }
    }
}

impl BreakerConfig {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_window(mut self, threshold: u32, window: Duration) -> Self {
        self.window_failure_threshold = threshold;
        self.window = window;
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default)]
pub struct BreakerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub state_changes: u32,
    pub current_state: BreakerState,
}

struct Inner {
    state: BreakerState,
    opened_at: Option<Instant>,
    /// Timestamps of recent failures, pruned to the window.
    recent_failures: VecDeque<Instant>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: RwLock<Inner>,
    consecutive_failures: AtomicU32,
    half_open_successes: AtomicU32,
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    rejected_requests: AtomicU64,
    state_changes: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                opened_at: None,
                recent_failures: VecDeque::new(),
            }),
            consecutive_failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            state_changes: AtomicU32::new(0),
        }
    }

    pub fn with_name(name: &str) -> Self {
        Self::new(BreakerConfig::new(name))
    }

    /// Current state, advancing Open → HalfOpen when the cool-down elapsed.
    pub fn state(&self) -> BreakerState {
        self.maybe_half_open();
        self.inner.read().state
    }

    /// Whether a request should be attempted right now.
    pub fn allow_request(&self) -> bool {
        !matches!(self.state(), BreakerState::Open)
    }

    pub fn record_success(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::SeqCst);

        let state = self.inner.read().state;
        if state == BreakerState::HalfOpen {
            let successes = self.half_open_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.success_threshold {
                self.transition_to(BreakerState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::SeqCst);

        let now = Instant::now();
        let (state, window_failures) = {
            let mut inner = self.inner.write();
            inner.recent_failures.push_back(now);
            while let Some(front) = inner.recent_failures.front() {
                if now.duration_since(*front) > self.config.window {
                    inner.recent_failures.pop_front();
                } else {
                    break;
                }
            }
            (inner.state, inner.recent_failures.len() as u32)
        };

        match state {
            BreakerState::Closed => {
                let consecutive = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if consecutive >= self.config.failure_threshold
                    || window_failures >= self.config.window_failure_threshold
                {
                    self.transition_to(BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                // Any failure during the probe reopens the circuit.
                self.transition_to(BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Force the circuit open, e.g. when a peer blows its error budget.
    pub fn trip(&self) {
        self.transition_to(BreakerState::Open);
    }

    /// Count a request rejected because the circuit was open.
    pub fn record_rejected(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            state_changes: self.state_changes.load(Ordering::Relaxed),
            current_state: self.state(),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.recent_failures.clear();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.half_open_successes.store(0, Ordering::SeqCst);
    }

    fn maybe_half_open(&self) {
        let should_probe = {
            let inner = self.inner.read();
            inner.state == BreakerState::Open
                && inner.opened_at.is_some_and(|t| t.elapsed() >= self.config.open_duration)
        };
        if should_probe {
            self.transition_to(BreakerState::HalfOpen);
        }
    }

    fn transition_to(&self, new_state: BreakerState) {
        let mut inner = self.inner.write();
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;
        self.state_changes.fetch_add(1, Ordering::SeqCst);

        match new_state {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                self.half_open_successes.store(0, Ordering::SeqCst);
                warn!(
                    breaker = %self.config.name,
                    from = ?old_state,
                    failures = self.consecutive_failures.load(Ordering::SeqCst),
                    "circuit opened"
                );
            }
            BreakerState::HalfOpen => {
                self.half_open_successes.store(0, Ordering::SeqCst);
                info!(breaker = %self.config.name, "circuit half-open, probing");
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                inner.recent_failures.clear();
                self.consecutive_failures.store(0, Ordering::SeqCst);
                info!(breaker = %self.config.name, from = ?old_state, "circuit closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_closed() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), BreakerState::Closed);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = CircuitBreaker::new(BreakerConfig::new("test").with_failure_threshold(3));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let cb = CircuitBreaker::new(
            BreakerConfig::new("test")
                .with_failure_threshold(3)
                .with_window(100, Duration::from_secs(60)),
        );
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_window_threshold_trips_despite_successes() {
        let cb = CircuitBreaker::new(
            BreakerConfig::new("test")
                .with_failure_threshold(100)
                .with_window(5, Duration::from_secs(60)),
        );
        for _ in 0..4 {
            cb.record_failure();
            cb.record_success();
        }
        assert_eq!(cb.state(), BreakerState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let cb = CircuitBreaker::new(
            BreakerConfig::new("test")
                .with_failure_threshold(1)
                .with_open_duration(Duration::from_millis(20)),
        );
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert!(cb.allow_request());
    }

    #[test]
    fn test_closes_after_probe_successes() {
        let cb = CircuitBreaker::new(
            BreakerConfig::new("test")
                .with_failure_threshold(1)
                .with_success_threshold(2)
                .with_open_duration(Duration::from_millis(10)),
        );
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new(
            BreakerConfig::new("test")
                .with_failure_threshold(1)
                .with_open_duration(Duration::from_millis(10)),
        );
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
    }

    #[test]
    fn test_stats() {
        let cb = CircuitBreaker::with_name("test");
        cb.record_success();
        cb.record_success();
        cb.record_failure();
        cb.record_rejected();

        let stats = cb.stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.rejected_requests, 1);
    }

    #[test]
    fn test_reset() {
        let cb = CircuitBreaker::new(BreakerConfig::new("test").with_failure_threshold(1));
        cb.record_failure();
        assert_eq!(cb.state(), BreakerState::Open);
        cb.reset();
        assert_eq!(cb.state(), BreakerState::Closed);
    }
}
