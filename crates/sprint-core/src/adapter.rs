//! Chain adapter capability.
//!
//! All chain-specific behavior — request normalization, height extraction,
//! head-subscription wire messages — lives behind this trait so the relay,
//! cache, and gate stay chain-agnostic. No provider-specific branches exist
//! anywhere else.

use crate::chain::ChainId;
use crate::error::ErrorKind;
use crate::types::{parse_hash32, BlockHash, MempoolEntry};
use serde_json::{json, Value};

/// Transport used to reach an upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    /// WebSocket subscription (JSON-RPC subscribe over WS).
    #[default]
    Ws,
    /// JSON-RPC over HTTP, head changes detected by delta polling.
    Http,
}

/// Per-endpoint connection decoration. Providers differ in header
/// requirements and idle timeouts; those differences are data, not code.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub kind: EndpointKind,
    /// Extra headers sent on connect (API keys, project ids).
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Protocol ping interval in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Provider idle timeout; providers at or below 60 s also get an
    /// out-of-band heartbeat message every 50 s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
    /// Per-request timeout for query traffic, milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

impl EndpointConfig {
    pub fn ws(url: &str) -> Self {
        Self {
            url: url.to_string(),
            kind: EndpointKind::Ws,
            headers: Vec::new(),
            heartbeat_secs: default_heartbeat_secs(),
            idle_timeout_secs: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }

    pub fn http(url: &str) -> Self {
        Self { kind: EndpointKind::Http, ..Self::ws(url) }
    }

    /// Whether this endpoint needs the 50 s out-of-band heartbeat.
    pub fn needs_oob_heartbeat(&self) -> bool {
        matches!(self.idle_timeout_secs, Some(t) if t <= 60)
    }
}

/// A head announcement parsed out of an upstream notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadAnnounce {
    pub hash: BlockHash,
    pub height: u64,
}

/// Chain-specific behavior as a capability set.
pub trait ChainAdapter: Send + Sync {
    fn chain(&self) -> ChainId;

    /// Validate and normalize request params so semantically identical
    /// requests fingerprint identically. Rejects unknown methods.
    fn normalize_request(&self, method: &str, params: &Value) -> Result<Value, ErrorKind>;

    /// Extract the source block height from a response payload, when the
    /// payload is height-addressed (used for reorg invalidation).
    fn extract_height(&self, method: &str, params: &Value) -> Option<u64>;

    /// Blocks this chain is assumed able to roll back.
    fn reorg_depth(&self) -> u64 {
        self.chain().default_reorg_depth()
    }

    /// Fallback endpoints used when config lists none.
    fn default_endpoints(&self) -> Vec<EndpointConfig>;

    /// JSON-RPC message that opens a new-heads subscription over WS.
    fn head_subscription(&self) -> Value;

    /// Parse a WS notification (or poll response) into a head announcement.
    fn parse_head(&self, payload: &Value) -> Option<HeadAnnounce>;

    /// Method + params used by HTTP long-poll peers to detect head changes.
    fn poll_request(&self) -> (&'static str, Value);

    /// JSON-RPC message that opens a mempool subscription, for chains that
    /// support one over WS.
    fn mempool_subscription(&self) -> Option<Value> {
        None
    }

    /// Parse a WS notification into a mempool observation.
    fn parse_mempool(&self, _payload: &Value) -> Option<MempoolEntry> {
        None
    }

    /// The request used by the sequence pre-warmer to prefetch a block at a
    /// given height with cheap metadata-only params.
    fn prefetch_request(&self, height: u64) -> (String, Value);
}

/// Look up the adapter for a chain. Total over [`ChainId`].
pub fn adapter_for(chain: ChainId) -> &'static dyn ChainAdapter {
    match chain {
        ChainId::Bitcoin => &BitcoinAdapter,
        ChainId::Ethereum => &EthereumAdapter,
        ChainId::Solana => &SolanaAdapter,
    }
}

fn normalize_hex(s: &str) -> String {
    let lower = s.to_ascii_lowercase();
    if let Some(body) = lower.strip_prefix("0x") {
        // Strip leading zeros from quantities but keep at least one digit.
        if body.len() <= 16 {
            let trimmed = body.trim_start_matches('0');
            return format!("0x{}", if trimmed.is_empty() { "0" } else { trimmed });
        }
        return lower;
    }
    lower
}

fn normalize_params(params: &Value) -> Value {
    match params {
        Value::Array(items) => {
            // Trailing nulls are meaningless in positional JSON-RPC params.
            let mut items: Vec<Value> = items.iter().map(normalize_params).collect();
            while items.last() == Some(&Value::Null) {
                items.pop();
            }
            Value::Array(items)
        }
        Value::Object(map) => {
            Value::Object(map.iter().map(|(k, v)| (k.clone(), normalize_params(v))).collect())
        }
        Value::String(s) => Value::String(normalize_hex(s)),
        other => other.clone(),
    }
}

// ────────────────────────── Bitcoin ──────────────────────────

pub struct BitcoinAdapter;

const BITCOIN_METHODS: &[&str] = &[
    "getbestblockhash",
    "getblock",
    "getblockhash",
    "getblockheader",
    "getblockcount",
    "getblockchaininfo",
    "getmempoolinfo",
    "getrawmempool",
    "getrawtransaction",
    "estimatesmartfee",
];

impl ChainAdapter for BitcoinAdapter {
    fn chain(&self) -> ChainId {
        ChainId::Bitcoin
    }

    fn normalize_request(&self, method: &str, params: &Value) -> Result<Value, ErrorKind> {
        if !BITCOIN_METHODS.contains(&method) {
            return Err(ErrorKind::unsupported(format!("bitcoin method {method}")));
        }
        if !matches!(params, Value::Array(_) | Value::Null) {
            return Err(ErrorKind::bad_request("bitcoin params must be a positional array"));
        }
        Ok(normalize_params(params))
    }

    fn extract_height(&self, method: &str, params: &Value) -> Option<u64> {
        match method {
            "getblockhash" => params.get(0).and_then(Value::as_u64),
            _ => None,
        }
    }

    fn default_endpoints(&self) -> Vec<EndpointConfig> {
        vec![
            EndpointConfig::http("http://127.0.0.1:8332"),
            EndpointConfig::http("http://127.0.0.1:8333"),
        ]
    }

    fn head_subscription(&self) -> Value {
        // bitcoind has no JSON-RPC subscription; WS endpoints here are
        // aggregator-style providers that accept the generic form.
        json!({"jsonrpc": "2.0", "id": 1, "method": "subscribe", "params": ["hashblock"]})
    }

    fn parse_head(&self, payload: &Value) -> Option<HeadAnnounce> {
        let hash = payload
            .get("hash")
            .or_else(|| payload.get("bestblockhash"))
            .and_then(Value::as_str)
            .and_then(parse_hash32)?;
        let height = payload.get("height").or_else(|| payload.get("blocks")).and_then(Value::as_u64)?;
        Some(HeadAnnounce { hash, height })
    }

    fn poll_request(&self) -> (&'static str, Value) {
        ("getblockchaininfo", json!([]))
    }

    fn prefetch_request(&self, height: u64) -> (String, Value) {
        ("getblockhash".to_string(), json!([height]))
    }
}

// ────────────────────────── Ethereum ──────────────────────────

pub struct EthereumAdapter;

const ETHEREUM_METHODS: &[&str] = &[
    "eth_blockNumber",
    "eth_getBlockByNumber",
    "eth_getBlockByHash",
    "eth_getTransactionByHash",
    "eth_getTransactionReceipt",
    "eth_getBalance",
    "eth_call",
    "eth_gasPrice",
    "eth_feeHistory",
    "eth_getLogs",
    "eth_chainId",
];

impl ChainAdapter for EthereumAdapter {
    fn chain(&self) -> ChainId {
        ChainId::Ethereum
    }

    fn normalize_request(&self, method: &str, params: &Value) -> Result<Value, ErrorKind> {
        if !ETHEREUM_METHODS.contains(&method) {
            return Err(ErrorKind::unsupported(format!("ethereum method {method}")));
        }
        if !matches!(params, Value::Array(_) | Value::Null) {
            return Err(ErrorKind::bad_request("ethereum params must be a positional array"));
        }
        Ok(normalize_params(params))
    }

    fn extract_height(&self, method: &str, params: &Value) -> Option<u64> {
        match method {
            "eth_getBlockByNumber" => params
                .get(0)
                .and_then(Value::as_str)
                .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()),
            _ => None,
        }
    }

    fn default_endpoints(&self) -> Vec<EndpointConfig> {
        vec![
            EndpointConfig::ws("ws://127.0.0.1:8546"),
            EndpointConfig::http("http://127.0.0.1:8545"),
        ]
    }

    fn head_subscription(&self) -> Value {
        json!({"jsonrpc": "2.0", "id": 1, "method": "eth_subscribe", "params": ["newHeads"]})
    }

    fn parse_head(&self, payload: &Value) -> Option<HeadAnnounce> {
        let hash = payload.get("hash").and_then(Value::as_str).and_then(parse_hash32)?;
        let height = payload
            .get("number")
            .and_then(Value::as_str)
            .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())?;
        Some(HeadAnnounce { hash, height })
    }

    fn poll_request(&self) -> (&'static str, Value) {
        ("eth_getBlockByNumber", json!(["latest", false]))
    }

    fn prefetch_request(&self, height: u64) -> (String, Value) {
        ("eth_getBlockByNumber".to_string(), json!([format!("0x{height:x}"), false]))
    }

    fn mempool_subscription(&self) -> Option<Value> {
        Some(json!({
            "jsonrpc": "2.0", "id": 2,
            "method": "eth_subscribe", "params": ["newPendingTransactions"]
        }))
    }

    fn parse_mempool(&self, payload: &Value) -> Option<MempoolEntry> {
        // The lightweight subscription only carries the tx hash; size and
        // fee are unknown until someone asks for the full body.
        let txid = payload.as_str().and_then(parse_hash32)?;
        Some(MempoolEntry {
            chain: ChainId::Ethereum,
            txid,
            size_bytes: 0,
            priority: 0,
            fee_rate: 0,
            first_seen: chrono::Utc::now(),
        })
    }
}

// ────────────────────────── Solana ──────────────────────────

pub struct SolanaAdapter;

const SOLANA_METHODS: &[&str] = &[
    "getSlot",
    "getBlock",
    "getBlockHeight",
    "getLatestBlockhash",
    "getTransaction",
    "getBalance",
    "getAccountInfo",
    "getRecentPrioritizationFees",
];

impl ChainAdapter for SolanaAdapter {
    fn chain(&self) -> ChainId {
        ChainId::Solana
    }

    fn normalize_request(&self, method: &str, params: &Value) -> Result<Value, ErrorKind> {
        if !SOLANA_METHODS.contains(&method) {
            return Err(ErrorKind::unsupported(format!("solana method {method}")));
        }
        Ok(normalize_params(params))
    }

    fn extract_height(&self, method: &str, params: &Value) -> Option<u64> {
        match method {
            "getBlock" => params.get(0).and_then(Value::as_u64),
            _ => None,
        }
    }

    fn default_endpoints(&self) -> Vec<EndpointConfig> {
        vec![
            EndpointConfig::ws("wss://api.mainnet-beta.solana.com"),
            EndpointConfig::http("https://api.mainnet-beta.solana.com"),
        ]
    }

    fn head_subscription(&self) -> Value {
        json!({"jsonrpc": "2.0", "id": 1, "method": "slotSubscribe", "params": []})
    }

    fn parse_head(&self, payload: &Value) -> Option<HeadAnnounce> {
        // Slot notifications carry no block hash; derive a stable 32-byte
        // key from the slot so dedup still collapses multi-peer delivery.
        // `getSlot` poll responses are a bare number.
        let slot = payload.as_u64().or_else(|| {
            payload
                .get("slot")
                .or_else(|| payload.get("root"))
                .or_else(|| payload.get("absoluteSlot"))
                .and_then(Value::as_u64)
        })?;
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&slot.to_be_bytes());
        Some(HeadAnnounce { hash, height: slot })
    }

    fn poll_request(&self) -> (&'static str, Value) {
        ("getSlot", json!([]))
    }

    fn prefetch_request(&self, height: u64) -> (String, Value) {
        (
            "getBlock".to_string(),
            json!([height, {"transactionDetails": "none", "rewards": false}]),
        )
    }
}
