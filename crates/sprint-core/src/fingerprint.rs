//! Canonical request fingerprints.
//!
//! A fingerprint identifies a semantically-unique request: two requests
//! that differ only in tenant, header order, or JSON formatting must hash
//! identically. Tenant identity is deliberately NOT part of the key; the
//! tier class is, so tiers with different freshness contracts never share
//! a cache entry.

use crate::chain::ChainId;
use crate::tier::Tier;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Cache-sharing class derived from the tenant tier.
///
/// One class per tier: each tier carries its own freshness contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TierClass(pub u8);

impl From<Tier> for TierClass {
    fn from(tier: Tier) -> Self {
        TierClass(tier.lane() as u8)
    }
}

/// Canonical hash over `(tier_class, chain, method, normalized_params)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint for a normalized request.
    ///
    /// `params` must already be normalized by the chain adapter; this
    /// function only canonicalizes JSON structure (sorted object keys,
    /// compact encoding).
    pub fn compute(class: TierClass, chain: ChainId, method: &str, params: &Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update([class.0]);
        hasher.update(chain.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(method.as_bytes());
        hasher.update([0u8]);
        let mut canonical = String::new();
        write_canonical(params, &mut canonical);
        hasher.update(canonical.as_bytes());
        Fingerprint(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Shard index for a cache with `shards` shards (power of two).
    pub fn shard_index(&self, shards: usize) -> usize {
        debug_assert!(shards.is_power_of_two());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        (u64::from_be_bytes(prefix) as usize) & (shards - 1)
    }

    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(0x{})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Write a canonical compact encoding of a JSON value: object keys sorted,
/// no insignificant whitespace.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serializes"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a = json!({"block": "0x64", "full": false});
        let b = json!({"full": false, "block": "0x64"});
        let fa = Fingerprint::compute(TierClass(4), ChainId::Ethereum, "eth_getBlockByNumber", &a);
        let fb = Fingerprint::compute(TierClass(4), ChainId::Ethereum, "eth_getBlockByNumber", &b);
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_tier_class_separates() {
        let params = json!(["0x64", false]);
        let turbo = Fingerprint::compute(TierClass(3), ChainId::Ethereum, "eth_getBlockByNumber", &params);
        let ent = Fingerprint::compute(TierClass(4), ChainId::Ethereum, "eth_getBlockByNumber", &params);
        assert_ne!(turbo, ent);
    }

    #[test]
    fn test_chain_and_method_separate() {
        let params = json!([100]);
        let a = Fingerprint::compute(TierClass(0), ChainId::Bitcoin, "getblockhash", &params);
        let b = Fingerprint::compute(TierClass(0), ChainId::Ethereum, "getblockhash", &params);
        let c = Fingerprint::compute(TierClass(0), ChainId::Bitcoin, "getblock", &params);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_shard_index_in_range() {
        let params = json!([1]);
        let fp = Fingerprint::compute(TierClass(0), ChainId::Bitcoin, "getblockhash", &params);
        assert!(fp.shard_index(32) < 32);
        assert!(fp.shard_index(1) == 0);
    }

    proptest! {
        #[test]
        fn prop_fingerprint_deterministic(height in 0u64..10_000_000, full in any::<bool>()) {
            let params = json!([format!("0x{height:x}"), full]);
            let a = Fingerprint::compute(TierClass(2), ChainId::Ethereum, "eth_getBlockByNumber", &params);
            let b = Fingerprint::compute(TierClass(2), ChainId::Ethereum, "eth_getBlockByNumber", &params);
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_distinct_params_distinct_prints(a in 0u64..1_000_000, b in 0u64..1_000_000) {
            prop_assume!(a != b);
            let fa = Fingerprint::compute(TierClass(0), ChainId::Bitcoin, "getblockhash", &json!([a]));
            let fb = Fingerprint::compute(TierClass(0), ChainId::Bitcoin, "getblockhash", &json!([b]));
            prop_assert_ne!(fa, fb);
        }
    }
}
