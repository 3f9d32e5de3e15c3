//! Chain identifiers and per-chain constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies an upstream blockchain network.
///
/// Each configured chain gets its own relay, cache namespace, and dedup
/// window. Adding a network means adding a variant here plus an adapter in
/// [`crate::adapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Bitcoin,
    Ethereum,
    Solana,
}

impl ChainId {
    /// All chains the gateway knows how to talk to.
    pub const ALL: [ChainId; 3] = [ChainId::Bitcoin, ChainId::Ethereum, ChainId::Solana];

    /// Lowercase canonical name, as used in URLs and config keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Bitcoin => "bitcoin",
            ChainId::Ethereum => "ethereum",
            ChainId::Solana => "solana",
        }
    }

    /// Default number of recent block hashes tracked for cross-peer dedup.
    pub fn default_dedup_window(&self) -> usize {
        2048
    }

    /// Default reorg depth: entries sourced from heights older than
    /// `head - depth` are considered stable.
    pub fn default_reorg_depth(&self) -> u64 {
        match self {
            ChainId::Bitcoin => 6,
            ChainId::Ethereum => 12,
            ChainId::Solana => 32,
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = UnknownChain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" | "btc" => Ok(ChainId::Bitcoin),
            "ethereum" | "eth" => Ok(ChainId::Ethereum),
            "solana" | "sol" => Ok(ChainId::Solana),
            other => Err(UnknownChain(other.to_string())),
        }
    }
}

/// Returned when a request names a chain the gateway is not built for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chain: {0}")]
pub struct UnknownChain(pub String);
