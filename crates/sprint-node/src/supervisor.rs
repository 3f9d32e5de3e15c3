//! Component lifecycle management.
//!
//! The supervisor owns every component, starts them leaves-first
//! (storage, entropy, cache, relay, fan-out, gate, pipeline, api), and
//! shuts them down in reverse dependency order on signal.

use crate::config::Config;
use async_trait::async_trait;
use serde_json::Value;
use sprint_api::GatewayContext;
use sprint_cache::{CacheConfig, PredictiveCache, Prefetcher, Prewarmer};
use sprint_core::{ChainId, ErrorKind};
use sprint_crypto::{BlockDigestFeed, EntropyGenerator, PeerHandshake};
use sprint_fanout::{Fanout, FanoutConfig};
use sprint_gate::{GateConfig, ShedLevel, TenantGate};
use sprint_pipeline::{Dispatcher, PipelineConfig, Pressure, UpstreamQuery};
use sprint_relay::{HttpUpstreamClient, Relay, RelayConfig};
use sprint_storage::GatewayDb;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Why startup failed, mapped to process exit codes.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// Exit code 2.
    #[error("no upstream reachable at startup")]
    UpstreamUnreachable,

    /// Exit code 4.
    #[error("required entropy sources unavailable: {0:?}")]
    EntropyUnavailable(Vec<String>),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Bridges the pipeline's upstream seam onto the relay.
struct RelayQuery(Arc<Relay>);

#[async_trait]
impl UpstreamQuery for RelayQuery {
    async fn query(
        &self,
        chain: ChainId,
        method: &str,
        params: &Value,
        deadline: Instant,
    ) -> Result<Value, ErrorKind> {
        self.0.query(chain, method, params, deadline).await
    }
}

/// Bridges the pre-warmer onto the pipeline at Pro priority.
struct PipelinePrefetcher(Arc<Dispatcher>);

#[async_trait]
impl Prefetcher for PipelinePrefetcher {
    async fn prefetch(&self, chain: ChainId, method: String, params: Value) {
        self.0.dispatch_speculative(chain, method, params).await;
    }
}

/// Shutdown broadcast shared by every long-lived task.
pub struct ShutdownHandler {
    flag: AtomicBool,
    sender: broadcast::Sender<()>,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { flag: AtomicBool::new(false), sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("initiating graceful shutdown");
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Block until SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler");
        info!("received ctrl-c");
    }
}

/// Owns every component instance.
pub struct Supervisor {
    config: Config,
    db: Arc<GatewayDb>,
    digest_feed: Arc<BlockDigestFeed>,
    entropy: Arc<EntropyGenerator>,
    cache: Arc<PredictiveCache>,
    relay: Arc<Relay>,
    gate: Arc<TenantGate>,
    dispatcher: Arc<Dispatcher>,
    fanout: Arc<Fanout>,
    shutdown: Arc<ShutdownHandler>,
    background: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Wire every component. Nothing runs until [`Supervisor::start`].
    pub fn build(config: Config) -> Result<Self, StartupError> {
        if let Some(parent) = config.storage.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StartupError::Other(anyhow::anyhow!("storage dir: {e}")))?;
        }
        let db = Arc::new(
            GatewayDb::open(&config.storage.path)
                .map_err(|e| StartupError::Other(anyhow::anyhow!("storage: {e}")))?,
        );

        let digest_feed = Arc::new(BlockDigestFeed::new());
        let entropy = Arc::new(EntropyGenerator::new(Arc::clone(&digest_feed)));

        // Static entropy sources are checked up front; block digests only
        // exist once a chain has delivered a head.
        let available = entropy.available_sources();
        let missing: Vec<String> = config
            .entropy
            .required_sources
            .iter()
            .filter(|s| s.as_str() != "block_digest" && !available.contains(&s.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(StartupError::EntropyUnavailable(missing));
        }

        let cache = Arc::new(PredictiveCache::new(CacheConfig {
            shards: config.cache.shards,
            max_entries_per_shard: config.cache.max_entries_per_shard,
            default_ttl: Duration::from_millis(config.cache.default_ttl_ms),
            sweep_interval: Duration::from_millis(config.cache.sweep_interval_ms),
        }));

        let relay_configs: Vec<RelayConfig> = config
            .chain_ids()
            .into_iter()
            .map(|(chain, chain_config)| RelayConfig {
                chain,
                endpoints: chain_config.endpoints.clone(),
                dedup_window: chain_config.dedup_window.unwrap_or(chain.default_dedup_window()),
                reorg_depth: chain_config.reorg_depth.unwrap_or(chain.default_reorg_depth()),
                tier: config.tier,
            })
            .collect();
        let relay = Arc::new(Relay::new(relay_configs, Arc::new(HttpUpstreamClient::new())));

        let handshake = match &config.peer_secret_ref {
            Some(secret_ref) => Some(
                PeerHandshake::from_secret_ref(secret_ref)
                    .map_err(|e| StartupError::Other(anyhow::anyhow!("peer secret: {e}")))?,
            ),
            None => None,
        };

        let gate = Arc::new(TenantGate::new(
            GateConfig {
                default_tier: config.default_tier,
                tier_limits: config.tier_limits(),
                audit_capacity: 4096,
            },
            Arc::clone(&db),
            handshake,
        ));

        let gate_for_pressure = Arc::clone(&gate);
        let dispatcher = Arc::new(Dispatcher::new(
            PipelineConfig {
                workers: config.pipeline.workers.unwrap_or_else(|| num_workers()),
                lane_capacities: config.lane_capacities(),
                shed_free_at: 0.80,
                shed_pro_at: 0.95,
            },
            Arc::clone(&cache),
            Arc::new(RelayQuery(Arc::clone(&relay))),
            Some(Box::new(move |pressure| {
                let level = match pressure {
                    Pressure::Normal => ShedLevel::Normal,
                    Pressure::ShedFree => ShedLevel::ShedFree,
                    Pressure::ShedPro => ShedLevel::ShedPro,
                };
                gate_for_pressure.set_shed_level(level);
            })),
        ));

        let fanout = Arc::new(Fanout::new(FanoutConfig::default()));

        Ok(Self {
            config,
            db,
            digest_feed,
            entropy,
            cache,
            relay,
            gate,
            dispatcher,
            fanout,
            shutdown: Arc::new(ShutdownHandler::new()),
            background: Vec::new(),
        })
    }

    pub fn shutdown_handler(&self) -> Arc<ShutdownHandler> {
        Arc::clone(&self.shutdown)
    }

    /// Start everything in dependency order.
    pub fn start(&mut self) -> Result<(), StartupError> {
        info!("starting components");

        self.background.push(self.cache.spawn_sweeper());
        self.background.push(self.gate.audit.spawn_writer(Arc::clone(&self.db)));

        self.relay.start();
        self.dispatcher.start();

        for chain in self.relay.configured_chains() {
            // Fan-out pumps, one per chain, preserve per-chain ordering.
            if let Ok(events) = self.relay.subscribe_blocks(chain) {
                self.background
                    .push(tokio::spawn(Arc::clone(&self.fanout).run_block_pump(events)));
            }
            if let Ok(entries) = self.relay.subscribe_mempool(chain) {
                self.background
                    .push(tokio::spawn(Arc::clone(&self.fanout).run_mempool_pump(entries)));
            }

            // Pre-warmer per chain: sequence prefetch + reorg invalidation.
            if let Ok(events) = self.relay.subscribe_blocks(chain) {
                let warmer = Prewarmer::new(
                    Arc::clone(&self.cache),
                    Arc::new(PipelinePrefetcher(Arc::clone(&self.dispatcher))),
                );
                self.background.push(tokio::spawn(warmer.run(events)));
            }

            // Entropy digest feed: block hashes strengthen Hybrid and up.
            if let Ok(mut events) = self.relay.subscribe_blocks(chain) {
                let feed = Arc::clone(&self.digest_feed);
                let mut shutdown = self.shutdown.subscribe();
                self.background.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            event = events.recv() => match event {
                                Ok(event) => feed.push(event.hash),
                                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                                Err(broadcast::error::RecvError::Closed) => break,
                            },
                            _ = shutdown.recv() => break,
                        }
                    }
                }));
            }
        }

        info!("components started");
        Ok(())
    }

    /// With `fail_fast`, verify at least one upstream answers.
    pub async fn check_upstreams(&self) -> Result<(), StartupError> {
        if !self.config.fail_fast {
            return Ok(());
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        for chain in self.relay.configured_chains() {
            let (method, params) = sprint_core::adapter_for(chain).poll_request();
            match self.relay.query(chain, method, &params, deadline).await {
                Ok(_) => return Ok(()),
                Err(err) => warn!(%chain, error = %err, "startup probe failed"),
            }
        }
        Err(StartupError::UpstreamUnreachable)
    }

    /// Shared state handed to the API layer.
    pub fn context(&self) -> Arc<GatewayContext> {
        Arc::new(GatewayContext {
            gate: Arc::clone(&self.gate),
            dispatcher: Arc::clone(&self.dispatcher),
            cache: Arc::clone(&self.cache),
            relay: Arc::clone(&self.relay),
            fanout: Arc::clone(&self.fanout),
            entropy: Arc::clone(&self.entropy),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        })
    }

    pub fn api_addr(&self) -> Result<SocketAddr, StartupError> {
        format!("{}:{}", self.config.api.bind_addr, self.config.api.port)
            .parse()
            .map_err(|e| StartupError::Other(anyhow::anyhow!("bad api address: {e}")))
    }

    /// Stop components in reverse dependency order.
    pub async fn stop(mut self) {
        info!("stopping components");
        self.shutdown.shutdown();

        // Pipeline first so no new upstream work starts.
        self.dispatcher.stop().await;
        self.relay.stop().await;

        // Flush what the audit writer has not picked up yet.
        for record in self.gate.audit.drain(usize::MAX) {
            let _ = self.db.append_audit(&record);
        }

        for task in self.background.drain(..) {
            task.abort();
        }
        info!("components stopped");
    }
}

fn num_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.path = dir.join("db");
        config
    }

    #[tokio::test]
    async fn test_build_and_context() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::build(test_config(dir.path())).unwrap();
        let ctx = supervisor.context();
        assert_eq!(ctx.relay.configured_chains().len(), 3);
        assert_eq!(ctx.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_static_entropy_sources_pass_build() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.entropy.required_sources = vec!["os_rng".to_string(), "timing_jitter".to_string()];
        assert!(Supervisor::build(config).is_ok());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        // Point at closed local ports; peers back off quietly.
        for chain in config.chains.values_mut() {
            for endpoint in &mut chain.endpoints {
                endpoint.url = "http://127.0.0.1:1".to_string();
            }
        }
        let mut supervisor = Supervisor::build(config).unwrap();
        supervisor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_handler_idempotent() {
        let handler = ShutdownHandler::new();
        let mut rx = handler.subscribe();
        handler.shutdown();
        handler.shutdown();
        assert!(handler.is_shutting_down());
        assert!(rx.recv().await.is_ok());
    }
}
