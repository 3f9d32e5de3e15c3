//! Service tier ladder.
//!
//! Tiers order admission, lane priority, and latency contracts. The
//! dispatch pipeline drains higher tiers preferentially (weights 16:8:4:2:1)
//! but never starves a lane.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Ordered tenant service class. `Free < Pro < Business < Turbo < Enterprise`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Pro,
    Business,
    Turbo,
    Enterprise,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Free, Tier::Pro, Tier::Business, Tier::Turbo, Tier::Enterprise];

    /// Lane index, 0 = Free .. 4 = Enterprise.
    pub fn lane(&self) -> usize {
        *self as usize
    }

    /// Weighted-drain share for this tier's lane.
    pub fn lane_weight(&self) -> u32 {
        match self {
            Tier::Free => 1,
            Tier::Pro => 2,
            Tier::Business => 4,
            Tier::Turbo => 8,
            Tier::Enterprise => 16,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Business => "business",
            Tier::Turbo => "turbo",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Whether this tier may request enterprise-level entropy.
    pub fn allows_enterprise_entropy(&self) -> bool {
        matches!(self, Tier::Enterprise)
    }

    /// Whether this tier may open mempool streams.
    pub fn allows_mempool_stream(&self) -> bool {
        *self >= Tier::Pro
    }

    /// Default admission limits for this tier. Overridable via config.
    pub fn default_limits(&self) -> TierLimits {
        match self {
            Tier::Free => TierLimits { rps: 1, burst: 5, concurrency: 2, deadline: Duration::from_millis(1000) },
            Tier::Pro => TierLimits { rps: 10, burst: 20, concurrency: 8, deadline: Duration::from_millis(300) },
            Tier::Business => TierLimits { rps: 50, burst: 100, concurrency: 32, deadline: Duration::from_millis(100) },
            // 20 ms is the full-path Turbo budget; the 5 ms figure applies to
            // the cache-hit path served at ingress.
            Tier::Turbo => TierLimits { rps: 200, burst: 400, concurrency: 64, deadline: Duration::from_millis(20) },
            Tier::Enterprise => TierLimits { rps: 1000, burst: 2000, concurrency: 256, deadline: Duration::from_millis(20) },
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "pro" => Ok(Tier::Pro),
            "business" => Ok(Tier::Business),
            "turbo" => Ok(Tier::Turbo),
            "enterprise" => Ok(Tier::Enterprise),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Admission limits for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    /// Token-bucket refill rate, requests per second.
    pub rps: u32,
    /// Token-bucket capacity.
    pub burst: u32,
    /// Max concurrent in-flight requests per tenant.
    pub concurrency: u32,
    /// Full-path latency budget.
    pub deadline: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Free < Tier::Pro);
        assert!(Tier::Pro < Tier::Business);
        assert!(Tier::Business < Tier::Turbo);
        assert!(Tier::Turbo < Tier::Enterprise);
    }

    #[test]
    fn test_lane_weights() {
        let weights: Vec<u32> = Tier::ALL.iter().map(|t| t.lane_weight()).collect();
        assert_eq!(weights, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_deadlines_shrink_with_tier() {
        let mut prev = Duration::MAX;
        for tier in [Tier::Free, Tier::Pro, Tier::Business, Tier::Turbo] {
            let d = tier.default_limits().deadline;
            assert!(d < prev, "deadline must tighten as tiers rise");
            prev = d;
        }
    }

    #[test]
    fn test_entropy_gating() {
        assert!(Tier::Enterprise.allows_enterprise_entropy());
        assert!(!Tier::Turbo.allows_enterprise_entropy());
    }
}
