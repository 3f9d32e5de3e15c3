//! Chain relay: multi-peer ingestion, dedup, and query routing.
//!
//! One [`ChainRelay`] per configured chain holds N upstream peers (WS
//! subscriptions or HTTP long-poll), collapses their deliveries through a
//! dedup window, and publishes exactly one normalized [`BlockEvent`] per
//! block onto the event bus. The same peers back the request-reply path
//! used on cache misses, routed to the healthiest peer first.

pub mod dedup;
pub mod health;
pub mod peer;
pub mod transport;

pub use health::{ChainHealth, PeerHealth};
pub use peer::{backoff_delay, PeerHandle, PeerState};
pub use transport::{HttpUpstreamClient, UpstreamClient, UpstreamError};

use dedup::{DedupWindow, Observation};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use sprint_core::{
    adapter_for, BlockEvent, ChainAdapter, ChainId, EndpointConfig, EndpointKind, ErrorKind,
    HeadAnnounce, MempoolEntry, PeerId, Tier,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Event bus depth per chain. Subscribers that fall further behind than
/// this see a lag error, not blocked producers.
const BUS_CAPACITY: usize = 1024;
/// HTTP long-poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Missed pongs before a WS session is torn down.
const MAX_MISSED_PONGS: u32 = 3;
/// Out-of-band heartbeat cadence for short-idle-timeout providers.
const OOB_HEARTBEAT: Duration = Duration::from_secs(50);

/// Per-chain relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub chain: ChainId,
    pub endpoints: Vec<EndpointConfig>,
    pub dedup_window: usize,
    pub reorg_depth: u64,
    /// Tier stamped onto published events; the gateway's own service tier.
    pub tier: Tier,
}

impl RelayConfig {
    /// Defaults for a chain: adapter-provided endpoints and windows.
    pub fn for_chain(chain: ChainId) -> Self {
        Self {
            chain,
            endpoints: adapter_for(chain).default_endpoints(),
            dedup_window: chain.default_dedup_window(),
            reorg_depth: chain.default_reorg_depth(),
            tier: Tier::Enterprise,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Failed(UpstreamError),
}

/// Relay for one chain. Owns its peers and the chain's event bus.
pub struct ChainRelay {
    chain: ChainId,
    adapter: &'static dyn ChainAdapter,
    config: RelayConfig,
    peers: Vec<Arc<PeerHandle>>,
    dedup: Mutex<DedupWindow>,
    mempool_dedup: Mutex<DedupWindow>,
    block_tx: broadcast::Sender<BlockEvent>,
    mempool_tx: broadcast::Sender<MempoolEntry>,
    latest: RwLock<Option<BlockEvent>>,
    health: RwLock<Arc<ChainHealth>>,
    client: Arc<dyn UpstreamClient>,
}

impl ChainRelay {
    fn new(config: RelayConfig, client: Arc<dyn UpstreamClient>) -> Self {
        let peers: Vec<Arc<PeerHandle>> = config
            .endpoints
            .iter()
            .enumerate()
            .map(|(i, ep)| Arc::new(PeerHandle::new(PeerId(i as u16), ep.clone())))
            .collect();
        let (block_tx, _) = broadcast::channel(BUS_CAPACITY);
        let (mempool_tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            chain: config.chain,
            adapter: adapter_for(config.chain),
            health: RwLock::new(Arc::new(ChainHealth::empty(config.chain))),
            dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
            mempool_dedup: Mutex::new(DedupWindow::new(config.dedup_window)),
            peers,
            block_tx,
            mempool_tx,
            latest: RwLock::new(None),
            client,
            config,
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    pub fn reorg_depth(&self) -> u64 {
        self.config.reorg_depth
    }

    pub fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent> {
        self.block_tx.subscribe()
    }

    pub fn subscribe_mempool(&self) -> broadcast::Receiver<MempoolEntry> {
        self.mempool_tx.subscribe()
    }

    pub fn latest_block(&self) -> Option<BlockEvent> {
        self.latest.read().clone()
    }

    pub fn health(&self) -> Arc<ChainHealth> {
        Arc::clone(&self.health.read())
    }

    fn refresh_health(&self) {
        let height = self.latest.read().as_ref().map(|e| e.height);
        let snapshot = Arc::new(ChainHealth::snapshot(self.chain, &self.peers, height));
        *self.health.write() = snapshot;
    }

    /// Ingest a head delivery from a peer. First observer publishes.
    fn ingest_head(&self, peer: &PeerHandle, head: HeadAnnounce, received_at: Instant) {
        peer.record_heard();
        let observation = self.dedup.lock().observe(head.hash, peer.id, received_at);
        match observation {
            Observation::First { observations } => {
                let event = BlockEvent {
                    chain: self.chain,
                    hash: head.hash,
                    height: head.height,
                    detected_at: received_at,
                    wall_time: chrono::Utc::now(),
                    source_peer: peer.id,
                    tier_observed: self.config.tier,
                    relay_latency: received_at.elapsed(),
                    peer_observations: observations,
                };
                debug!(chain = %self.chain, height = head.height, peer = %peer.id, "new head");
                *self.latest.write() = Some(event.clone());
                // No subscribers yet is fine; the bus drops the event.
                let _ = self.block_tx.send(event);
                self.refresh_health();
            }
            Observation::Duplicate { observations, .. } => {
                debug!(chain = %self.chain, height = head.height, peer = %peer.id,
                       observations, "duplicate head suppressed");
            }
        }
    }

    /// Mempool observations dedup on txid the same way blocks dedup on
    /// hash; the ring doubles as the TTL window.
    fn ingest_mempool(&self, peer: &PeerHandle, entry: MempoolEntry) {
        peer.record_heard();
        let observation = self.mempool_dedup.lock().observe(entry.txid, peer.id, Instant::now());
        if matches!(observation, Observation::First { .. }) {
            let _ = self.mempool_tx.send(entry);
        }
    }

    /// Peers in routing-preference order, circuit-open peers excluded.
    fn ranked_peers(&self) -> Vec<Arc<PeerHandle>> {
        let mut candidates: Vec<Arc<PeerHandle>> =
            self.peers.iter().filter(|p| p.breaker.allow_request()).cloned().collect();
        candidates.sort_by(|a, b| {
            let (a_conn, a_rep, a_lat) = a.routing_score();
            let (b_conn, b_rep, b_lat) = b.routing_score();
            b_conn.cmp(&a_conn).then(b_rep.cmp(&a_rep)).then(a_lat.cmp(&b_lat))
        });
        candidates
    }

    /// Request-reply path for cache misses. Routes to the healthiest peer,
    /// falls through the ranking on failure, and never outlives `deadline`.
    pub async fn query(
        &self,
        method: &str,
        params: &Value,
        deadline: Instant,
    ) -> Result<Value, ErrorKind> {
        let candidates = self.ranked_peers();
        if candidates.is_empty() {
            return Err(ErrorKind::circuit_open(self.chain.as_str()));
        }

        let mut last_error: Option<UpstreamError> = None;
        for peer in candidates {
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorKind::DeadlineExceeded);
            }
            let budget = (deadline - now).min(Duration::from_millis(peer.config.request_timeout_ms));

            let started = Instant::now();
            match self.client.request(&peer.config, method, params, budget).await {
                Ok(value) => {
                    peer.record_success(started.elapsed());
                    return Ok(value);
                }
                Err(UpstreamError::Rpc { code, message }) => {
                    // The upstream understood us and said no; retrying
                    // elsewhere won't change the answer.
                    peer.record_success(started.elapsed());
                    return Err(ErrorKind::upstream(format!("rpc {code}: {message}")));
                }
                Err(err) => {
                    peer.record_failure();
                    if Instant::now() >= deadline {
                        return Err(ErrorKind::DeadlineExceeded);
                    }
                    warn!(chain = %self.chain, peer = %peer.id, error = %err, "peer query failed");
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(UpstreamError::Timeout) => Err(ErrorKind::DeadlineExceeded),
            Some(err) => Err(ErrorKind::upstream(err.to_string())),
            None => Err(ErrorKind::circuit_open(self.chain.as_str())),
        }
    }

    fn has_healthy_sibling(&self, exclude: PeerId) -> bool {
        self.peers.iter().any(|p| p.id != exclude && p.state().is_connected())
    }

    /// Supervise one peer: connect, run a session, back off, repeat.
    async fn run_peer(self: Arc<Self>, peer: Arc<PeerHandle>, mut shutdown: broadcast::Receiver<()>) {
        let mut attempt: u32 = 0;
        loop {
            if !peer.breaker.allow_request() {
                // Circuit open: wait out the cool-down without hammering.
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.recv() => break,
                }
            }

            peer.set_state(PeerState::Connecting);
            self.refresh_health();

            let end = match peer.config.kind {
                EndpointKind::Ws => self.ws_session(&peer, &mut shutdown).await,
                EndpointKind::Http => self.poll_session(&peer, &mut shutdown).await,
            };

            peer.set_state(PeerState::Draining);
            peer.set_state(PeerState::Disconnected);
            self.refresh_health();

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(err) => {
                    peer.record_failure();
                    attempt += 1;
                    let delay = backoff_delay(attempt, self.has_healthy_sibling(peer.id));
                    warn!(chain = %self.chain, peer = %peer.id, error = %err,
                          backoff_ms = delay.as_millis() as u64, "peer session ended");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
        peer.set_state(PeerState::Disconnected);
    }

    /// One WS session: handshake, subscribe, pump messages + heartbeats.
    async fn ws_session(
        &self,
        peer: &Arc<PeerHandle>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let stream = match transport::ws_connect(&peer.config).await {
            Ok(stream) => stream,
            Err(err) => return SessionEnd::Failed(err),
        };
        let (mut sink, mut source) = stream.split();

        peer.set_state(PeerState::Handshaking);
        let sub = self.adapter.head_subscription().to_string();
        if let Err(err) = sink.send(Message::Text(sub)).await {
            return SessionEnd::Failed(UpstreamError::Transport(err.to_string()));
        }
        if let Some(mempool_sub) = self.adapter.mempool_subscription() {
            if let Err(err) = sink.send(Message::Text(mempool_sub.to_string())).await {
                return SessionEnd::Failed(UpstreamError::Transport(err.to_string()));
            }
        }
        peer.set_state(PeerState::Subscribed);
        info!(chain = %self.chain, peer = %peer.id, url = %peer.config.url, "subscribed");

        let mut ping_timer =
            tokio::time::interval(Duration::from_secs(peer.config.heartbeat_secs.max(1)));
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping_timer.tick().await; // first tick fires immediately
        let mut oob_timer = tokio::time::interval(OOB_HEARTBEAT);
        oob_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        oob_timer.tick().await;
        let mut pending_pongs: u32 = 0;

        loop {
            tokio::select! {
                message = source.next() => {
                    let received_at = Instant::now();
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            peer.set_state(PeerState::Receiving);
                            self.handle_ws_text(peer, &text, received_at);
                            peer.set_state(PeerState::Idle);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                return SessionEnd::Failed(UpstreamError::Transport(
                                    "pong send failed".to_string(),
                                ));
                            }
                            peer.record_heard();
                        }
                        Some(Ok(Message::Pong(_))) => {
                            pending_pongs = 0;
                            peer.record_heard();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Failed(UpstreamError::Transport(
                                "connection closed".to_string(),
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            return SessionEnd::Failed(UpstreamError::Transport(err.to_string()));
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if pending_pongs >= MAX_MISSED_PONGS {
                        return SessionEnd::Failed(UpstreamError::Transport(
                            format!("{pending_pongs} pings unanswered"),
                        ));
                    }
                    pending_pongs += 1;
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        return SessionEnd::Failed(UpstreamError::Transport(
                            "ping send failed".to_string(),
                        ));
                    }
                }
                _ = oob_timer.tick(), if peer.config.needs_oob_heartbeat() => {
                    let beat = r#"{"jsonrpc":"2.0","method":"heartbeat"}"#.to_string();
                    if sink.send(Message::Text(beat)).await.is_err() {
                        return SessionEnd::Failed(UpstreamError::Transport(
                            "heartbeat send failed".to_string(),
                        ));
                    }
                }
                _ = shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }

    fn handle_ws_text(&self, peer: &Arc<PeerHandle>, text: &str, received_at: Instant) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                peer.record_malformed();
                return;
            }
        };

        // Subscription notifications carry the payload under params.result;
        // plain responses (subscription acks) are logged and dropped.
        let Some(result) = value.pointer("/params/result") else {
            debug!(chain = %self.chain, peer = %peer.id, "non-notification message");
            return;
        };

        if let Some(head) = self.adapter.parse_head(result) {
            self.ingest_head(peer, head, received_at);
        } else if let Some(entry) = self.adapter.parse_mempool(result) {
            self.ingest_mempool(peer, entry);
        } else {
            peer.record_malformed();
        }
    }

    /// One HTTP long-poll session: hit the poll request on a fixed cadence
    /// and ingest head changes. Ends after repeated failures.
    async fn poll_session(
        &self,
        peer: &Arc<PeerHandle>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> SessionEnd {
        let (method, params) = self.adapter.poll_request();
        let mut consecutive_errors: u32 = 0;
        let mut last_hash = None;
        peer.set_state(PeerState::Subscribed);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    let started = Instant::now();
                    let timeout = Duration::from_millis(peer.config.request_timeout_ms);
                    match self.client.request(&peer.config, method, &params, timeout).await {
                        Ok(result) => {
                            consecutive_errors = 0;
                            peer.record_success(started.elapsed());
                            if let Some(head) = self.adapter.parse_head(&result) {
                                if last_hash != Some(head.hash) {
                                    last_hash = Some(head.hash);
                                    self.ingest_head(peer, head, started);
                                }
                            } else {
                                peer.record_malformed();
                            }
                        }
                        Err(err) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= 3 {
                                return SessionEnd::Failed(err);
                            }
                        }
                    }
                }
                _ = shutdown.recv() => return SessionEnd::Shutdown,
            }
        }
    }
}

/// Multi-chain relay façade owned by the supervisor.
pub struct Relay {
    chains: HashMap<ChainId, Arc<ChainRelay>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Relay {
    pub fn new(configs: Vec<RelayConfig>, client: Arc<dyn UpstreamClient>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let chains = configs
            .into_iter()
            .map(|config| (config.chain, Arc::new(ChainRelay::new(config, Arc::clone(&client)))))
            .collect();
        Self { chains, shutdown_tx, tasks: Mutex::new(Vec::new()) }
    }

    /// Spawn every peer's supervision task.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        for relay in self.chains.values() {
            for peer in &relay.peers {
                let relay = Arc::clone(relay);
                let peer = Arc::clone(peer);
                let shutdown = self.shutdown_tx.subscribe();
                tasks.push(tokio::spawn(relay.run_peer(peer, shutdown)));
            }
        }
        info!(chains = self.chains.len(), "relay started");
    }

    /// Signal every peer task to drain and wait for them.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
        info!("relay stopped");
    }

    pub fn configured_chains(&self) -> Vec<ChainId> {
        let mut chains: Vec<ChainId> = self.chains.keys().copied().collect();
        chains.sort();
        chains
    }

    fn chain(&self, chain: ChainId) -> Result<&Arc<ChainRelay>, ErrorKind> {
        self.chains
            .get(&chain)
            .ok_or_else(|| ErrorKind::unsupported(format!("chain {chain} not configured")))
    }

    /// Lazy, restartable block stream. Fails fast on unconfigured chains.
    pub fn subscribe_blocks(&self, chain: ChainId) -> Result<broadcast::Receiver<BlockEvent>, ErrorKind> {
        Ok(self.chain(chain)?.subscribe_blocks())
    }

    pub fn subscribe_mempool(
        &self,
        chain: ChainId,
    ) -> Result<broadcast::Receiver<MempoolEntry>, ErrorKind> {
        Ok(self.chain(chain)?.subscribe_mempool())
    }

    /// Blocking (from the caller's view) request-reply with a deadline.
    pub async fn query(
        &self,
        chain: ChainId,
        method: &str,
        params: &Value,
        deadline: Instant,
    ) -> Result<Value, ErrorKind> {
        self.chain(chain)?.query(method, params, deadline).await
    }

    pub fn health(&self, chain: ChainId) -> Result<Arc<ChainHealth>, ErrorKind> {
        Ok(self.chain(chain)?.health())
    }

    pub fn latest_block(&self, chain: ChainId) -> Result<Option<BlockEvent>, ErrorKind> {
        Ok(self.chain(chain)?.latest_block())
    }

    pub fn reorg_depth(&self, chain: ChainId) -> Result<u64, ErrorKind> {
        Ok(self.chain(chain)?.reorg_depth())
    }

    /// Test-support: hand a head delivery to the relay as if a peer
    /// produced it.
    pub fn inject_head(
        &self,
        chain: ChainId,
        peer: PeerId,
        head: HeadAnnounce,
    ) -> Result<(), ErrorKind> {
        let relay = self.chain(chain)?;
        let handle = relay
            .peers
            .get(peer.0 as usize)
            .ok_or_else(|| ErrorKind::bad_request(format!("no peer {peer}")))?;
        relay.ingest_head(handle, head, Instant::now());
        Ok(())
    }
}
