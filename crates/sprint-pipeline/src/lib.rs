//! Tiered dispatch pipeline.
//!
//! Five bounded lanes, one per tier, drained by a weighted worker pool
//! (16:8:4:2:1, Enterprise first, never starving Free). The pipeline's
//! contract: complete within the request's tier deadline or fail with
//! `DeadlineExceeded`. Cache hits never enter a lane; misses claim the
//! single-flight slot before going upstream.

pub mod lane;

pub use lane::{queue_capacity, Lane};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use sprint_cache::{CacheOutcome, ClaimGuard, ClaimResult, PredictiveCache};
use sprint_core::{
    BreakerConfig, ChainId, CircuitBreaker, ErrorKind, Fingerprint, Tier, TierClass,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{debug, info, warn};

/// Lane drain weights, Free..Enterprise.
const LANE_WEIGHTS: [u32; 5] = [1, 2, 4, 8, 16];
/// Requests with less than this much budget left are refused pre-enqueue.
const MIN_ENQUEUE_BUDGET: Duration = Duration::from_millis(1);

/// Upstream query seam. The node wires this to the relay; tests script it.
#[async_trait]
pub trait UpstreamQuery: Send + Sync {
    async fn query(
        &self,
        chain: ChainId,
        method: &str,
        params: &Value,
        deadline: Instant,
    ) -> Result<Value, ErrorKind>;
}

/// Everything a worker needs to serve one admitted request.
#[derive(Debug)]
pub struct DispatchRequest {
    pub chain: ChainId,
    pub method: String,
    pub params: Value,
    pub fingerprint: Fingerprint,
    pub class: TierClass,
    pub tier: Tier,
    pub deadline: Instant,
    /// Pre-warm requests carry this; their cache entries evict first.
    pub speculative: bool,
    pub ttl: Option<Duration>,
    pub source_height: Option<u64>,
    /// Extra fingerprints to co-populate with the same payload (used by
    /// the pre-warmer to warm every tier class off one upstream call).
    pub co_fingerprints: Vec<Fingerprint>,
}

#[derive(Debug)]
struct Job {
    request: DispatchRequest,
    guard: ClaimGuard,
    reply: oneshot::Sender<Result<Bytes, ErrorKind>>,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Per-lane capacities, Free..Enterprise. Powers of two.
    pub lane_capacities: [usize; 5],
    /// Occupancy fractions at which the gate starts shedding.
    pub shed_free_at: f64,
    pub shed_pro_at: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(2),
            lane_capacities: [1024; 5],
            shed_free_at: 0.80,
            shed_pro_at: 0.95,
        }
    }
}

/// Pipeline counters, exported as Prometheus text.
#[derive(Default)]
pub struct PipelineMetrics {
    pub completed: AtomicU64,
    pub deadline_exceeded: AtomicU64,
    pub overloaded: AtomicU64,
    pub circuit_open: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub flight_joins: AtomicU64,
}

impl PipelineMetrics {
    pub fn export(&self) -> String {
        format!(
            r#"# HELP sprint_pipeline_completed_total Requests completed upstream
# TYPE sprint_pipeline_completed_total counter
sprint_pipeline_completed_total {}

# HELP sprint_pipeline_deadline_exceeded_total Requests that ran out of budget
# TYPE sprint_pipeline_deadline_exceeded_total counter
sprint_pipeline_deadline_exceeded_total {}

# HELP sprint_pipeline_overloaded_total Requests refused on full lanes
# TYPE sprint_pipeline_overloaded_total counter
sprint_pipeline_overloaded_total {}

# HELP sprint_pipeline_circuit_open_total Requests short-circuited by breakers
# TYPE sprint_pipeline_circuit_open_total counter
sprint_pipeline_circuit_open_total {}

# HELP sprint_pipeline_upstream_errors_total Upstream failures after retries
# TYPE sprint_pipeline_upstream_errors_total counter
sprint_pipeline_upstream_errors_total {}

# HELP sprint_pipeline_flight_joins_total Requests coalesced onto an in-flight fetch
# TYPE sprint_pipeline_flight_joins_total counter
sprint_pipeline_flight_joins_total {}
"#,
            self.completed.load(Ordering::Relaxed),
            self.deadline_exceeded.load(Ordering::Relaxed),
            self.overloaded.load(Ordering::Relaxed),
            self.circuit_open.load(Ordering::Relaxed),
            self.upstream_errors.load(Ordering::Relaxed),
            self.flight_joins.load(Ordering::Relaxed),
        )
    }
}

/// Reported to the gate when the hottest lane crosses a watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Normal,
    ShedFree,
    ShedPro,
}

type PressureSink = dyn Fn(Pressure) + Send + Sync;

/// The dispatcher.
pub struct Dispatcher {
    config: PipelineConfig,
    lanes: Vec<Lane<Job>>,
    cache: Arc<PredictiveCache>,
    upstream: Arc<dyn UpstreamQuery>,
    breakers: DashMap<(ChainId, String), Arc<CircuitBreaker>>,
    work_ready: Notify,
    pressure_sink: Option<Box<PressureSink>>,
    pub metrics: PipelineMetrics,
    shutdown_tx: broadcast::Sender<()>,
    workers: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        config: PipelineConfig,
        cache: Arc<PredictiveCache>,
        upstream: Arc<dyn UpstreamQuery>,
        pressure_sink: Option<Box<PressureSink>>,
    ) -> Self {
        let lanes = config.lane_capacities.iter().map(|&cap| Lane::new(cap)).collect();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            lanes,
            cache,
            upstream,
            breakers: DashMap::new(),
            work_ready: Notify::new(),
            pressure_sink,
            metrics: PipelineMetrics::default(),
            shutdown_tx,
            workers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.workers {
            let dispatcher = Arc::clone(self);
            let shutdown = self.shutdown_tx.subscribe();
            workers.push(tokio::spawn(dispatcher.worker_loop(worker_id, shutdown)));
        }
        info!(workers = self.config.workers, "dispatch pipeline started");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
        }
        info!("dispatch pipeline stopped");
    }

    /// Serve one admitted request end to end.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Bytes, ErrorKind> {
        let now = Instant::now();
        if request.deadline <= now + MIN_ENQUEUE_BUDGET {
            self.metrics.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
            return Err(ErrorKind::DeadlineExceeded);
        }

        // Hits bypass the lanes entirely.
        match self.cache.get(&request.fingerprint) {
            CacheOutcome::Hit(payload) => return Ok(payload),
            CacheOutcome::InFlight(waiter) => {
                // Joins the waiter list directly, no lane admission.
                self.metrics.flight_joins.fetch_add(1, Ordering::Relaxed);
                return waiter.wait(request.deadline).await;
            }
            CacheOutcome::Miss => {}
        }

        if !self.breaker(request.chain, &request.method).allow_request() {
            self.breaker(request.chain, &request.method).record_rejected();
            self.metrics.circuit_open.fetch_add(1, Ordering::Relaxed);
            return Err(ErrorKind::circuit_open(format!("{}/{}", request.chain, request.method)));
        }

        let guard = match self.cache.claim(request.fingerprint) {
            ClaimResult::Claimed(guard) => guard,
            ClaimResult::AlreadyInFlight(waiter) => {
                self.metrics.flight_joins.fetch_add(1, Ordering::Relaxed);
                return waiter.wait(request.deadline).await;
            }
        };

        let deadline = request.deadline;
        let lane_idx = request.tier.lane();
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job { request, guard, reply: reply_tx };

        if let Err(refused) = self.lanes[lane_idx].try_push(job) {
            // Dropping the refused job's guard frees the flight slot.
            drop(refused);
            self.metrics.overloaded.fetch_add(1, Ordering::Relaxed);
            return Err(ErrorKind::Overloaded);
        }
        self.report_pressure();
        self.work_ready.notify_one();

        match tokio::time::timeout_at(deadline.into(), reply_rx).await {
            Ok(Ok(result)) => result,
            // Worker vanished without replying; its guard already
            // propagated an error to other waiters.
            Ok(Err(_)) => Err(ErrorKind::upstream("dispatch worker dropped request")),
            Err(_) => {
                self.metrics.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
                Err(ErrorKind::DeadlineExceeded)
            }
        }
    }

    /// Speculative pre-warm entry point. Runs at Pro lane priority and
    /// warms every tier class off a single upstream call.
    pub async fn dispatch_speculative(&self, chain: ChainId, method: String, params: Value) {
        let fingerprints: Vec<Fingerprint> = Tier::ALL
            .iter()
            .map(|t| Fingerprint::compute(TierClass::from(*t), chain, &method, &params))
            .collect();
        let primary = fingerprints[Tier::Pro.lane()];
        let co: Vec<Fingerprint> =
            fingerprints.into_iter().filter(|fp| *fp != primary).collect();

        let request = DispatchRequest {
            chain,
            source_height: sprint_core::adapter_for(chain).extract_height(&method, &params),
            method,
            params,
            fingerprint: primary,
            class: TierClass::from(Tier::Pro),
            tier: Tier::Pro,
            deadline: Instant::now() + Duration::from_secs(2),
            speculative: true,
            ttl: None,
            co_fingerprints: co,
        };
        if let Err(err) = self.dispatch(request).await {
            debug!(error = %err, "speculative prefetch failed");
        }
    }

    /// Occupancy of the fullest lane.
    pub fn hottest_occupancy(&self) -> f64 {
        self.lanes.iter().map(|l| l.occupancy()).fold(0.0, f64::max)
    }

    pub fn lane_depths(&self) -> [usize; 5] {
        let mut depths = [0; 5];
        for (i, lane) in self.lanes.iter().enumerate() {
            depths[i] = lane.len();
        }
        depths
    }

    fn report_pressure(&self) {
        let Some(sink) = &self.pressure_sink else { return };
        let occupancy = self.hottest_occupancy();
        let pressure = if occupancy >= self.config.shed_pro_at {
            Pressure::ShedPro
        } else if occupancy >= self.config.shed_free_at {
            Pressure::ShedFree
        } else {
            Pressure::Normal
        };
        sink(pressure);
    }

    fn breaker(&self, chain: ChainId, method: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((chain, method.to_string()))
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    BreakerConfig::new(&format!("{chain}/{method}"))
                        .with_failure_threshold(8)
                        .with_window(20, Duration::from_secs(30))
                        .with_open_duration(Duration::from_secs(10)),
                ))
            })
            .clone()
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker_id, "dispatch worker up");
        let mut credits = LANE_WEIGHTS;
        loop {
            while let Some(job) = self.pick_job(&mut credits) {
                self.run_job(job).await;
                self.report_pressure();
            }
            tokio::select! {
                _ = self.work_ready.notified() => {}
                _ = shutdown.recv() => break,
            }
        }
        debug!(worker_id, "dispatch worker down");
    }

    /// Weighted round-robin pop: higher lanes drain first until their
    /// credits run out, then the refill lets lower lanes through.
    fn pick_job(&self, credits: &mut [u32; 5]) -> Option<Job> {
        for pass in 0..2 {
            for lane_idx in (0..5).rev() {
                if credits[lane_idx] == 0 {
                    continue;
                }
                if let Some(job) = self.lanes[lane_idx].pop() {
                    credits[lane_idx] -= 1;
                    return Some(job);
                }
            }
            if pass == 0 {
                *credits = LANE_WEIGHTS;
            }
        }
        None
    }

    async fn run_job(&self, job: Job) {
        let Job { request, guard, reply } = job;
        let now = Instant::now();

        let result = if request.deadline <= now {
            self.metrics.deadline_exceeded.fetch_add(1, Ordering::Relaxed);
            Err(ErrorKind::DeadlineExceeded)
        } else {
            let breaker = self.breaker(request.chain, &request.method);
            if !breaker.allow_request() {
                breaker.record_rejected();
                self.metrics.circuit_open.fetch_add(1, Ordering::Relaxed);
                Err(ErrorKind::circuit_open(format!("{}/{}", request.chain, request.method)))
            } else {
                match self
                    .upstream
                    .query(request.chain, &request.method, &request.params, request.deadline)
                    .await
                {
                    Ok(value) => {
                        breaker.record_success();
                        let payload = Bytes::from(value.to_string());
                        self.cache.put(
                            request.fingerprint,
                            request.chain,
                            payload.clone(),
                            request.ttl,
                            request.source_height,
                            request.speculative,
                        );
                        for co in &request.co_fingerprints {
                            self.cache.put(
                                *co,
                                request.chain,
                                payload.clone(),
                                request.ttl,
                                request.source_height,
                                request.speculative,
                            );
                        }
                        self.metrics.completed.fetch_add(1, Ordering::Relaxed);
                        Ok(payload)
                    }
                    Err(err) => {
                        match err {
                            ErrorKind::Upstream { .. } | ErrorKind::DeadlineExceeded => {
                                breaker.record_failure();
                                self.metrics.upstream_errors.fetch_add(1, Ordering::Relaxed);
                            }
                            _ => {}
                        }
                        warn!(chain = %request.chain, method = %request.method, error = %err,
                              "upstream query failed");
                        Err(err)
                    }
                }
            }
        };

        guard.fulfill(result.clone());
        let _ = reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprint_cache::CacheConfig;
    use std::sync::atomic::AtomicU64;

    struct StubUpstream {
        delay: Duration,
        calls: AtomicU64,
        fail: bool,
    }

    impl StubUpstream {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self { delay, calls: AtomicU64::new(0), fail: false })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { delay: Duration::ZERO, calls: AtomicU64::new(0), fail: true })
        }
    }

    #[async_trait]
    impl UpstreamQuery for StubUpstream {
        async fn query(
            &self,
            _chain: ChainId,
            method: &str,
            _params: &Value,
            deadline: Instant,
        ) -> Result<Value, ErrorKind> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ErrorKind::upstream("stub failure"));
            }
            let now = Instant::now();
            if now + self.delay > deadline {
                tokio::time::sleep_until(deadline.into()).await;
                return Err(ErrorKind::DeadlineExceeded);
            }
            tokio::time::sleep(self.delay).await;
            Ok(serde_json::json!({"method": method}))
        }
    }

    fn request(tier: Tier, method: &str, deadline_ms: u64) -> DispatchRequest {
        let params = serde_json::json!([]);
        DispatchRequest {
            chain: ChainId::Ethereum,
            method: method.to_string(),
            params: params.clone(),
            fingerprint: Fingerprint::compute(
                TierClass::from(tier),
                ChainId::Ethereum,
                method,
                &params,
            ),
            class: TierClass::from(tier),
            tier,
            deadline: Instant::now() + Duration::from_millis(deadline_ms),
            speculative: false,
            ttl: None,
            source_height: None,
            co_fingerprints: Vec::new(),
        }
    }

    fn dispatcher(upstream: Arc<dyn UpstreamQuery>) -> Arc<Dispatcher> {
        let cache = Arc::new(PredictiveCache::new(CacheConfig {
            shards: 4,
            ..CacheConfig::default()
        }));
        let dispatcher = Arc::new(Dispatcher::new(
            PipelineConfig { workers: 2, ..PipelineConfig::default() },
            cache,
            upstream,
            None,
        ));
        dispatcher.start();
        dispatcher
    }

    #[tokio::test]
    async fn test_dispatch_roundtrip_and_cache_fill() {
        let upstream = StubUpstream::new(Duration::ZERO);
        let d = dispatcher(upstream.clone());

        let result = d.dispatch(request(Tier::Enterprise, "eth_blockNumber", 500)).await.unwrap();
        assert!(result.windows(b"eth_blockNumber".len()).any(|w| w == b"eth_blockNumber"));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        // Second identical request is a pure cache hit.
        let again = d.dispatch(request(Tier::Enterprise, "eth_blockNumber", 500)).await.unwrap();
        assert_eq!(result, again);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
        d.stop().await;
    }

    #[tokio::test]
    async fn test_single_flight_scenario() {
        // 50 concurrent identical Enterprise requests, cold cache: exactly
        // one upstream call, identical responses for all.
        let upstream = StubUpstream::new(Duration::from_millis(20));
        let d = dispatcher(upstream.clone());

        let mut handles = Vec::new();
        for _ in 0..50 {
            let d = Arc::clone(&d);
            handles.push(tokio::spawn(async move {
                d.dispatch(request(Tier::Enterprise, "eth_getBlockByNumber", 1000)).await
            }));
        }

        let mut payloads = Vec::new();
        for handle in handles {
            payloads.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1, "exactly one upstream call");
        assert!(payloads.windows(2).all(|w| w[0] == w[1]), "all 50 responses identical");
        d.stop().await;
    }

    #[tokio::test]
    async fn test_deadline_exceeded_on_slow_upstream() {
        // Free tier deadline 100 ms, upstream needs 400 ms.
        let upstream = StubUpstream::new(Duration::from_millis(400));
        let d = dispatcher(upstream);

        let started = Instant::now();
        let err = d.dispatch(request(Tier::Free, "eth_call", 100)).await.unwrap_err();
        assert_eq!(err, ErrorKind::DeadlineExceeded);
        // Completed within deadline + scheduling slack.
        assert!(started.elapsed() < Duration::from_millis(200));
        d.stop().await;
    }

    #[tokio::test]
    async fn test_zero_deadline_rejected_pre_enqueue() {
        let upstream = StubUpstream::new(Duration::ZERO);
        let d = dispatcher(upstream.clone());

        let mut req = request(Tier::Pro, "eth_call", 1000);
        req.deadline = Instant::now();
        assert_eq!(d.dispatch(req).await.unwrap_err(), ErrorKind::DeadlineExceeded);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 0, "never enqueued");
        d.stop().await;
    }

    #[tokio::test]
    async fn test_full_lane_overloads() {
        let upstream = StubUpstream::new(Duration::from_millis(200));
        let cache = Arc::new(PredictiveCache::new(CacheConfig {
            shards: 4,
            ..CacheConfig::default()
        }));
        // Tiny Free lane, no workers: pushes accumulate.
        let d = Arc::new(Dispatcher::new(
            PipelineConfig { workers: 0, lane_capacities: [2, 2, 2, 2, 2], ..PipelineConfig::default() },
            cache,
            upstream,
            None,
        ));

        let mut accepted = Vec::new();
        for i in 0..3 {
            let method = format!("m{i}");
            let d2 = Arc::clone(&d);
            accepted.push(tokio::spawn(async move {
                d2.dispatch(request(Tier::Free, &method, 50)).await
            }));
        }
        let mut outcomes = Vec::new();
        for handle in accepted {
            outcomes.push(handle.await.unwrap());
        }
        let overloaded =
            outcomes.iter().filter(|o| matches!(o, Err(ErrorKind::Overloaded))).count();
        assert_eq!(overloaded, 1, "third push found the lane full: {outcomes:?}");
    }

    #[tokio::test]
    async fn test_breaker_short_circuits_after_failures() {
        let upstream = StubUpstream::failing();
        let d = dispatcher(upstream.clone());

        for i in 0..8 {
            // Distinct params so each attempt goes upstream.
            let mut req = request(Tier::Business, "eth_call", 500);
            req.params = serde_json::json!([i]);
            req.fingerprint = Fingerprint::compute(
                req.class,
                req.chain,
                &req.method,
                &req.params,
            );
            let _ = d.dispatch(req).await;
        }

        let mut req = request(Tier::Business, "eth_call", 500);
        req.params = serde_json::json!([99]);
        req.fingerprint = Fingerprint::compute(req.class, req.chain, &req.method, &req.params);
        let calls_before = upstream.calls.load(Ordering::SeqCst);
        let err = d.dispatch(req).await.unwrap_err();
        assert!(matches!(err, ErrorKind::CircuitOpen { .. }));
        assert_eq!(upstream.calls.load(Ordering::SeqCst), calls_before, "no upstream touch");
        d.stop().await;
    }

    #[tokio::test]
    async fn test_weighted_pick_prefers_enterprise() {
        let upstream = StubUpstream::new(Duration::ZERO);
        let cache = Arc::new(PredictiveCache::new(CacheConfig {
            shards: 4,
            ..CacheConfig::default()
        }));
        let d = Dispatcher::new(
            PipelineConfig { workers: 0, ..PipelineConfig::default() },
            cache,
            upstream,
            None,
        );

        // Enqueue one job in Free and one in Enterprise by hand.
        for tier in [Tier::Free, Tier::Enterprise] {
            let req = request(tier, "eth_call", 500);
            let ClaimResult::Claimed(guard) = d.cache.claim(req.fingerprint) else {
                panic!("claim");
            };
            let (tx, _rx) = oneshot::channel();
            d.lanes[tier.lane()].try_push(Job { request: req, guard, reply: tx }).unwrap();
        }

        let mut credits = LANE_WEIGHTS;
        let first = d.pick_job(&mut credits).unwrap();
        assert_eq!(first.request.tier, Tier::Enterprise);
        let second = d.pick_job(&mut credits).unwrap();
        assert_eq!(second.request.tier, Tier::Free);
        assert!(d.pick_job(&mut credits).is_none());
    }

    #[tokio::test]
    async fn test_pressure_reported() {
        use parking_lot::Mutex;
        let upstream = StubUpstream::new(Duration::from_millis(200));
        let cache = Arc::new(PredictiveCache::new(CacheConfig {
            shards: 4,
            ..CacheConfig::default()
        }));
        let seen: Arc<Mutex<Vec<Pressure>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let d = Arc::new(Dispatcher::new(
            PipelineConfig {
                workers: 0,
                lane_capacities: [2, 2, 2, 2, 2],
                ..PipelineConfig::default()
            },
            cache,
            upstream,
            Some(Box::new(move |p| seen2.lock().push(p))),
        ));

        let d2 = Arc::clone(&d);
        let handle = tokio::spawn(async move {
            d2.dispatch(request(Tier::Free, "only", 50)).await
        });
        let _ = handle.await;
        // One enqueue on a 2-slot lane: 50% occupancy, still Normal.
        assert!(seen.lock().contains(&Pressure::Normal));
    }
}
