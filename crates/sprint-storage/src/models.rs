//! Stored record shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sprint_core::{ChainId, Tier};

/// A tenant, keyed by the SHA-256 hash of its API key.
///
/// The presented key itself is never stored, only the hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// SHA-256 of the API key.
    pub key_hash: [u8; 32],
    /// Human-facing id, used in the tenants API.
    pub tenant_id: String,
    pub tier: Tier,
    /// Overrides the tier default when set.
    pub rate_limit_rps: Option<u32>,
    pub burst: Option<u32>,
    /// Requests remaining this month.
    pub quota_remaining: u64,
    /// Month the quota applies to, `YYYY-MM`. A new month resets the quota.
    pub quota_month: String,
    pub quota_monthly_limit: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl TenantRecord {
    /// Whether this record admits requests at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Outcome of an admission decision, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Admitted,
    Unauthenticated,
    RateLimited,
    QuotaExhausted,
    Shed,
}

/// One admission decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub decision: AuditDecision,
    pub tier: Option<Tier>,
    pub chain: Option<ChainId>,
    pub method: Option<String>,
}

/// One served request, for the optional monthly request log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub ts: DateTime<Utc>,
    pub tenant_id: String,
    pub chain: ChainId,
    pub method: String,
    pub cache_hit: bool,
    pub latency_us: u64,
    pub outcome: String,
}
