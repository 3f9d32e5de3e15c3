use serde::{Deserialize, Serialize};
use sprint_core::{ChainId, EndpointConfig, Tier, TierLimits};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Gateway configuration, loaded from TOML at startup and immutable after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway service tier, stamped on relayed events.
    #[serde(default)]
    pub tier: Tier,

    /// Tier assumed for anonymous access to public endpoints.
    #[serde(default)]
    pub default_tier: Tier,

    /// Exit with code 2 when no upstream is reachable at startup.
    #[serde(default)]
    pub fail_fast: bool,

    pub api: ApiConfig,

    /// Per-chain upstream configuration, keyed by chain name.
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,

    #[serde(default)]
    pub cache: CacheSettings,

    /// Per-tier rate limits, keyed by tier name.
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitSettings>,

    #[serde(default)]
    pub pipeline: PipelineSettings,

    #[serde(default)]
    pub entropy: EntropySettings,

    /// External secret reference for the fan-out peer handshake:
    /// `env:NAME` or `file:/path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_secret_ref: Option<String>,

    pub storage: StorageSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind_addr: "127.0.0.1".to_string(), port: 8480 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Upstream endpoints; two or more for cross-peer dedup.
    pub endpoints: Vec<EndpointConfig>,

    /// Recent-hash window for cross-peer dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_window: Option<usize>,

    /// Blocks this chain is assumed able to roll back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reorg_depth: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub shards: usize,
    pub max_entries_per_shard: usize,
    pub default_ttl_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { shards: 32, max_entries_per_shard: 4096, default_ttl_ms: 12_000, sweep_interval_ms: 5_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub rps: u32,
    pub burst: u32,
    pub concurrency: u32,
    pub deadline_ms: u64,
}

impl RateLimitSettings {
    pub fn to_limits(&self) -> TierLimits {
        TierLimits {
            rps: self.rps,
            burst: self.burst,
            concurrency: self.concurrency,
            deadline: Duration::from_millis(self.deadline_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Worker count; defaults to the core count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Assumed aggregate service rate (req/s) for lane sizing.
    #[serde(default = "default_service_rate")]
    pub assumed_service_rate: f64,
}

fn default_service_rate() -> f64 {
    2_000.0
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self { workers: None, assumed_service_rate: default_service_rate() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntropySettings {
    /// Sources that must be present at startup; the node refuses to run
    /// without them (exit code 4). `block_digest` is excluded from the
    /// startup check since it only exists once a chain has produced one.
    #[serde(default)]
    pub required_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { path: PathBuf::from("./data/sprint") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON formatted logs
    pub json_format: bool,

    /// Log to file
    pub log_to_file: bool,

    /// Log file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json_format: false, log_to_file: false, log_file: None }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut chains = HashMap::new();
        for chain in ChainId::ALL {
            chains.insert(
                chain.as_str().to_string(),
                ChainConfig {
                    endpoints: sprint_core::adapter_for(chain).default_endpoints(),
                    dedup_window: None,
                    reorg_depth: None,
                },
            );
        }
        Self {
            tier: Tier::Enterprise,
            default_tier: Tier::Free,
            fail_fast: false,
            api: ApiConfig::default(),
            chains,
            cache: CacheSettings::default(),
            rate_limits: HashMap::new(),
            pipeline: PipelineSettings::default(),
            entropy: EntropySettings::default(),
            peer_secret_ref: None,
            storage: StorageSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.port == 0 {
            anyhow::bail!("Invalid API port: 0");
        }
        if self.api.bind_addr.parse::<std::net::IpAddr>().is_err() {
            anyhow::bail!("Invalid bind_addr: {}", self.api.bind_addr);
        }

        if self.chains.is_empty() {
            anyhow::bail!("At least one chain must be configured");
        }
        for (name, chain) in &self.chains {
            if ChainId::from_str(name).is_err() {
                anyhow::bail!("Unknown chain in config: {}", name);
            }
            if chain.endpoints.is_empty() {
                anyhow::bail!("Chain {} has no endpoints", name);
            }
            if let Some(window) = chain.dedup_window {
                if window == 0 {
                    anyhow::bail!("Chain {} dedup_window must be greater than 0", name);
                }
            }
        }

        if !self.cache.shards.is_power_of_two() {
            anyhow::bail!("cache.shards must be a power of two, got {}", self.cache.shards);
        }
        if self.cache.max_entries_per_shard == 0 {
            anyhow::bail!("cache.max_entries_per_shard must be greater than 0");
        }
        if self.cache.default_ttl_ms == 0 {
            anyhow::bail!("cache.default_ttl_ms must be greater than 0");
        }

        for (name, limits) in &self.rate_limits {
            if Tier::from_str(name).is_err() {
                anyhow::bail!("Unknown tier in rate_limits: {}", name);
            }
            if limits.rps == 0 || limits.burst == 0 {
                anyhow::bail!("rate_limits.{}: rps and burst must be greater than 0", name);
            }
            if limits.deadline_ms == 0 {
                anyhow::bail!("rate_limits.{}: deadline_ms must be greater than 0", name);
            }
        }

        if let Some(workers) = self.pipeline.workers {
            if workers == 0 {
                anyhow::bail!("pipeline.workers must be greater than 0");
            }
        }

        const KNOWN_SOURCES: [&str; 4] =
            ["os_rng", "timing_jitter", "block_digest", "hardware_fingerprint"];
        for source in &self.entropy.required_sources {
            if !KNOWN_SOURCES.contains(&source.as_str()) {
                anyhow::bail!("Unknown entropy source: {}", source);
            }
        }

        if let Some(secret_ref) = &self.peer_secret_ref {
            if !secret_ref.starts_with("env:") && !secret_ref.starts_with("file:") {
                anyhow::bail!("peer_secret_ref must be env:NAME or file:/path");
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        Ok(())
    }

    /// Chains with their parsed ids, in config order.
    pub fn chain_ids(&self) -> Vec<(ChainId, &ChainConfig)> {
        let mut chains: Vec<(ChainId, &ChainConfig)> = self
            .chains
            .iter()
            .filter_map(|(name, cfg)| ChainId::from_str(name).ok().map(|id| (id, cfg)))
            .collect();
        chains.sort_by_key(|(id, _)| *id);
        chains
    }

    /// Effective per-tier limits: config overrides or tier defaults.
    pub fn tier_limits(&self) -> HashMap<Tier, TierLimits> {
        let mut limits = HashMap::new();
        for tier in Tier::ALL {
            let configured = self.rate_limits.get(tier.as_str()).map(|r| r.to_limits());
            limits.insert(tier, configured.unwrap_or_else(|| tier.default_limits()));
        }
        limits
    }

    /// Lane capacities from the queueing formula over configured rates.
    pub fn lane_capacities(&self) -> [usize; 5] {
        let limits = self.tier_limits();
        let mut capacities = [0usize; 5];
        for tier in Tier::ALL {
            let l = limits[&tier];
            let peak = l.rps.max(l.burst) as f64;
            capacities[tier.lane()] =
                sprint_pipeline::queue_capacity(peak, self.pipeline.assumed_service_rate).max(64);
        }
        capacities
    }
}
