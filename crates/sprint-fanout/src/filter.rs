//! Subscription filters: pure predicates over events.

use serde::{Deserialize, Serialize};
use sprint_core::{BlockEvent, ChainId, MempoolEntry};
use std::collections::HashSet;

/// Filter expression attached to a subscription. Every field is a pure
/// function of the event; there is no stateful matching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Restrict to these chains; empty means all.
    #[serde(default)]
    pub chains: HashSet<ChainId>,
    /// Suppress blocks below this height.
    #[serde(default)]
    pub min_height: Option<u64>,
    /// Whether mempool entries are wanted at all.
    #[serde(default)]
    pub include_mempool: bool,
    /// Minimum fee rate for mempool entries.
    #[serde(default)]
    pub min_fee_rate: Option<u64>,
}

impl SubscriptionFilter {
    pub fn chains(chains: impl IntoIterator<Item = ChainId>) -> Self {
        Self { chains: chains.into_iter().collect(), ..Self::default() }
    }

    pub fn matches_block(&self, event: &BlockEvent) -> bool {
        if !self.chains.is_empty() && !self.chains.contains(&event.chain) {
            return false;
        }
        if let Some(min) = self.min_height {
            if event.height < min {
                return false;
            }
        }
        true
    }

    pub fn matches_mempool(&self, entry: &MempoolEntry) -> bool {
        if !self.include_mempool {
            return false;
        }
        if !self.chains.is_empty() && !self.chains.contains(&entry.chain) {
            return false;
        }
        if let Some(min) = self.min_fee_rate {
            if entry.fee_rate < min {
                return false;
            }
        }
        true
    }
}
