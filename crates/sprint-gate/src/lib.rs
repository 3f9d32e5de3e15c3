//! Tenant gate: authentication, rate limiting, quota, and audit in front
//! of the dispatch pipeline.
//!
//! Admission order per request: resolve the presented key to a tenant,
//! apply the shed level, take a token, decrement quota, acquire a
//! concurrency permit, stamp the tier deadline. Every decision lands on
//! the audit buffer.

pub mod audit;
pub mod bucket;

pub use audit::AuditSink;
pub use bucket::TokenBucket;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sprint_core::{ChainId, ErrorKind, Tier, TierClass, TierLimits};
use sprint_crypto::{HandshakeError, PeerHandshake};
use sprint_storage::{AuditDecision, AuditRecord, GatewayDb, RequestLogRecord, TenantRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// SHA-256 of a presented API key. The only form a key ever takes at rest.
pub fn hash_api_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Load-shedding stage, driven by pipeline lane occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedLevel {
    /// All tiers admitted.
    Normal,
    /// >= 80% occupancy: Free tier rejected.
    ShedFree,
    /// >= 95% occupancy: Pro and below rejected.
    ShedPro,
}

impl ShedLevel {
    fn sheds(&self, tier: Tier) -> bool {
        match self {
            ShedLevel::Normal => false,
            ShedLevel::ShedFree => tier == Tier::Free,
            ShedLevel::ShedPro => tier <= Tier::Pro,
        }
    }

    fn as_u8(&self) -> u8 {
        match self {
            ShedLevel::Normal => 0,
            ShedLevel::ShedFree => 1,
            ShedLevel::ShedPro => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ShedLevel::ShedFree,
            2 => ShedLevel::ShedPro,
            _ => ShedLevel::Normal,
        }
    }
}

/// Gate configuration.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Tier assumed for anonymous access to public endpoints.
    pub default_tier: Tier,
    /// Per-tier limits; tiers absent here use their built-in defaults.
    pub tier_limits: HashMap<Tier, TierLimits>,
    pub audit_capacity: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { default_tier: Tier::Free, tier_limits: HashMap::new(), audit_capacity: 4096 }
    }
}

/// Releases the tenant's concurrency slot when the request ends, on every
/// exit path.
pub struct ConcurrencyPermit {
    counter: Arc<AtomicU32>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A request admitted through the gate.
pub struct Admission {
    pub tenant_id: String,
    pub tier: Tier,
    pub class: TierClass,
    pub deadline: Instant,
    #[allow(dead_code)]
    permit: ConcurrencyPermit,
}

/// Gate counters, exported in Prometheus text form.
#[derive(Default)]
pub struct GateMetrics {
    pub admitted: AtomicU64,
    pub unauthenticated: AtomicU64,
    pub rate_limited: AtomicU64,
    pub quota_exhausted: AtomicU64,
    pub shed: AtomicU64,
}

impl GateMetrics {
    pub fn export(&self) -> String {
        format!(
            r#"# HELP sprint_gate_admitted_total Requests admitted
# TYPE sprint_gate_admitted_total counter
sprint_gate_admitted_total {}

# HELP sprint_gate_unauthenticated_total Requests rejected for auth
# TYPE sprint_gate_unauthenticated_total counter
sprint_gate_unauthenticated_total {}

# HELP sprint_gate_rate_limited_total Requests rejected by token bucket
# TYPE sprint_gate_rate_limited_total counter
sprint_gate_rate_limited_total {}

# HELP sprint_gate_quota_exhausted_total Requests rejected on quota
# TYPE sprint_gate_quota_exhausted_total counter
sprint_gate_quota_exhausted_total {}

# HELP sprint_gate_shed_total Requests shed under backpressure
# TYPE sprint_gate_shed_total counter
sprint_gate_shed_total {}
"#,
            self.admitted.load(Ordering::Relaxed),
            self.unauthenticated.load(Ordering::Relaxed),
            self.rate_limited.load(Ordering::Relaxed),
            self.quota_exhausted.load(Ordering::Relaxed),
            self.shed.load(Ordering::Relaxed),
        )
    }
}

/// Pure admission check over a tenant record snapshot. The stateful steps
/// (bucket, quota, concurrency) come after and only if this passes.
pub fn evaluate_record(record: Option<&TenantRecord>, now: DateTime<Utc>) -> Result<Tier, ErrorKind> {
    match record {
        Some(record) if record.is_usable(now) => Ok(record.tier),
        _ => Err(ErrorKind::Unauthenticated),
    }
}

/// The tenant gate.
pub struct TenantGate {
    config: GateConfig,
    db: Arc<GatewayDb>,
    tenants: DashMap<[u8; 32], TenantRecord>,
    buckets: DashMap<[u8; 32], Arc<TokenBucket>>,
    quotas: DashMap<[u8; 32], Arc<AtomicU64>>,
    inflight: DashMap<[u8; 32], Arc<AtomicU32>>,
    shed: AtomicU8,
    pub audit: Arc<AuditSink>,
    handshake: Option<PeerHandshake>,
    pub metrics: GateMetrics,
}

impl TenantGate {
    pub fn new(config: GateConfig, db: Arc<GatewayDb>, handshake: Option<PeerHandshake>) -> Self {
        let audit = Arc::new(AuditSink::new(config.audit_capacity));
        Self {
            config,
            db,
            tenants: DashMap::new(),
            buckets: DashMap::new(),
            quotas: DashMap::new(),
            inflight: DashMap::new(),
            shed: AtomicU8::new(0),
            audit,
            handshake,
            metrics: GateMetrics::default(),
        }
    }

    pub fn shed_level(&self) -> ShedLevel {
        ShedLevel::from_u8(self.shed.load(Ordering::Relaxed))
    }

    /// Called by the pipeline when lane occupancy crosses a watermark.
    pub fn set_shed_level(&self, level: ShedLevel) {
        let prev = self.shed.swap(level.as_u8(), Ordering::Relaxed);
        if prev != level.as_u8() {
            warn!(?level, "shed level changed");
        }
    }

    fn limits_for(&self, record: &TenantRecord) -> TierLimits {
        let mut limits = self
            .config
            .tier_limits
            .get(&record.tier)
            .copied()
            .unwrap_or_else(|| record.tier.default_limits());
        if let Some(rps) = record.rate_limit_rps {
            limits.rps = rps;
        }
        if let Some(burst) = record.burst {
            limits.burst = burst;
        }
        limits
    }

    fn load_record(&self, key_hash: &[u8; 32]) -> Option<TenantRecord> {
        if let Some(cached) = self.tenants.get(key_hash) {
            return Some(cached.clone());
        }
        let record = self.db.get_tenant(key_hash).ok().flatten()?;
        self.tenants.insert(*key_hash, record.clone());
        Some(record)
    }

    /// Roll the quota over when the month changed.
    fn current_quota(&self, record: &TenantRecord, now: DateTime<Utc>) -> Arc<AtomicU64> {
        let month = now.format("%Y-%m").to_string();
        if record.quota_month != month {
            let mut updated = record.clone();
            updated.quota_month = month;
            updated.quota_remaining = updated.quota_monthly_limit;
            let _ = self.db.put_tenant(&updated);
            self.tenants.insert(record.key_hash, updated.clone());
            let quota = Arc::new(AtomicU64::new(updated.quota_remaining));
            self.quotas.insert(record.key_hash, Arc::clone(&quota));
            return quota;
        }
        self.quotas
            .entry(record.key_hash)
            .or_insert_with(|| Arc::new(AtomicU64::new(record.quota_remaining)))
            .clone()
    }

    fn audit_decision(
        &self,
        tenant_id: Option<&str>,
        decision: AuditDecision,
        tier: Option<Tier>,
        chain: Option<ChainId>,
        method: Option<&str>,
    ) {
        self.audit.emit(AuditRecord {
            ts: Utc::now(),
            tenant_id: tenant_id.map(str::to_string),
            decision,
            tier,
            chain,
            method: method.map(str::to_string),
        });
    }

    /// Admit one request. See the module docs for the order of checks.
    pub fn admit(
        &self,
        presented_key: Option<&str>,
        chain: Option<ChainId>,
        method: Option<&str>,
    ) -> Result<Admission, ErrorKind> {
        let Some(key) = presented_key else {
            self.metrics.unauthenticated.fetch_add(1, Ordering::Relaxed);
            self.audit_decision(None, AuditDecision::Unauthenticated, None, chain, method);
            return Err(ErrorKind::Unauthenticated);
        };

        let now_wall = Utc::now();
        let key_hash = hash_api_key(key);
        let record = self.load_record(&key_hash);
        let tier = match evaluate_record(record.as_ref(), now_wall) {
            Ok(tier) => tier,
            Err(err) => {
                self.metrics.unauthenticated.fetch_add(1, Ordering::Relaxed);
                self.audit_decision(None, AuditDecision::Unauthenticated, None, chain, method);
                return Err(err);
            }
        };
        let record = record.expect("record exists when evaluate_record passes");
        let tenant_id = record.tenant_id.clone();

        if self.shed_level().sheds(tier) {
            self.metrics.shed.fetch_add(1, Ordering::Relaxed);
            self.audit_decision(Some(tenant_id.as_str()), AuditDecision::Shed, Some(tier), chain, method);
            return Err(ErrorKind::Overloaded);
        }

        let limits = self.limits_for(&record);
        let bucket = self
            .buckets
            .entry(key_hash)
            .or_insert_with(|| Arc::new(TokenBucket::new(limits.rps, limits.burst)))
            .clone();
        if let Err(retry_after_ms) = bucket.try_acquire(Instant::now()) {
            self.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.audit_decision(Some(tenant_id.as_str()), AuditDecision::RateLimited, Some(tier), chain, method);
            return Err(ErrorKind::RateLimited { retry_after_ms });
        }

        let quota = self.current_quota(&record, now_wall);
        let mut remaining = quota.load(Ordering::SeqCst);
        loop {
            if remaining == 0 {
                self.metrics.quota_exhausted.fetch_add(1, Ordering::Relaxed);
                self.audit_decision(
                    Some(tenant_id.as_str()),
                    AuditDecision::QuotaExhausted,
                    Some(tier),
                    chain,
                    method,
                );
                return Err(ErrorKind::QuotaExhausted);
            }
            match quota.compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break,
                Err(actual) => remaining = actual,
            }
        }
        // Write-behind persistence: flush the counter periodically instead
        // of on every request.
        if remaining % 64 == 0 {
            let mut updated = record.clone();
            updated.quota_remaining = remaining - 1;
            let _ = self.db.put_tenant(&updated);
            self.tenants.insert(key_hash, updated);
        }

        let inflight =
            self.inflight.entry(key_hash).or_insert_with(|| Arc::new(AtomicU32::new(0))).clone();
        if inflight.fetch_add(1, Ordering::SeqCst) >= limits.concurrency {
            inflight.fetch_sub(1, Ordering::SeqCst);
            self.audit_decision(Some(tenant_id.as_str()), AuditDecision::Shed, Some(tier), chain, method);
            return Err(ErrorKind::Overloaded);
        }

        self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
        self.audit_decision(Some(tenant_id.as_str()), AuditDecision::Admitted, Some(tier), chain, method);
        Ok(Admission {
            tenant_id,
            tier,
            class: TierClass::from(tier),
            deadline: Instant::now() + limits.deadline,
            permit: ConcurrencyPermit { counter: inflight },
        })
    }

    /// Validate a fan-out peer handshake: HMAC over (nonce, timestamp)
    /// inside the replay window.
    pub fn verify_peer_handshake(
        &self,
        nonce: &[u8],
        timestamp_secs: i64,
        tag: &[u8],
    ) -> Result<(), ErrorKind> {
        let Some(handshake) = &self.handshake else {
            return Err(ErrorKind::unsupported("peer handshake not configured"));
        };
        handshake
            .verify(nonce, timestamp_secs, tag, Utc::now().timestamp())
            .map_err(|err: HandshakeError| {
                warn!(error = %err, "peer handshake rejected");
                ErrorKind::Unauthenticated
            })
    }

    /// Provision a tenant, returning its record. Used by operator tooling
    /// and tests; the raw key is hashed and discarded.
    pub fn create_tenant(
        &self,
        tenant_id: &str,
        api_key: &str,
        tier: Tier,
        monthly_quota: u64,
    ) -> Result<TenantRecord, ErrorKind> {
        let now = Utc::now();
        let record = TenantRecord {
            key_hash: hash_api_key(api_key),
            tenant_id: tenant_id.to_string(),
            tier,
            rate_limit_rps: None,
            burst: None,
            quota_remaining: monthly_quota,
            quota_month: now.format("%Y-%m").to_string(),
            quota_monthly_limit: monthly_quota,
            expires_at: None,
            active: true,
            created_at: now,
        };
        self.db
            .put_tenant(&record)
            .map_err(|e| ErrorKind::upstream(format!("tenant store: {e}")))?;
        self.tenants.insert(record.key_hash, record.clone());
        info!(tenant = tenant_id, tier = %tier, "tenant provisioned");
        Ok(record)
    }

    /// Append one served request to the monthly request log. Failures are
    /// swallowed; the log is operational, never on the request's error path.
    pub fn log_request(
        &self,
        tenant_id: &str,
        chain: ChainId,
        method: &str,
        cache_hit: bool,
        latency: Duration,
        outcome: &str,
    ) {
        let record = RequestLogRecord {
            ts: Utc::now(),
            tenant_id: tenant_id.to_string(),
            chain,
            method: method.to_string(),
            cache_hit,
            latency_us: latency.as_micros() as u64,
            outcome: outcome.to_string(),
        };
        let _ = self.db.append_request_log(&record);
    }

    /// Remaining quota for the tenants API.
    pub fn quota_status(&self, tenant_id: &str) -> Option<(u64, u64)> {
        let record = self
            .tenants
            .iter()
            .find(|entry| entry.tenant_id == tenant_id)
            .map(|entry| entry.value().clone())
            .or_else(|| self.db.find_tenant_by_id(tenant_id).ok().flatten())?;
        let remaining = self
            .quotas
            .get(&record.key_hash)
            .map(|q| q.load(Ordering::SeqCst))
            .unwrap_or(record.quota_remaining);
        Some((remaining, record.quota_monthly_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprint_crypto::SecureBuffer;

    fn gate_with(config: GateConfig) -> (TenantGate, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(GatewayDb::open(dir.path()).unwrap());
        let secret = SecureBuffer::from_slice(b"peer-secret").unwrap();
        (TenantGate::new(config, db, Some(PeerHandshake::new(secret))), dir)
    }

    fn gate() -> (TenantGate, tempfile::TempDir) {
        gate_with(GateConfig::default())
    }

    #[test]
    fn test_missing_key_unauthenticated() {
        let (gate, _dir) = gate();
        let err = gate.admit(None, None, None).unwrap_err();
        assert_eq!(err, ErrorKind::Unauthenticated);
        assert_eq!(gate.metrics.unauthenticated.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unknown_key_unauthenticated() {
        let (gate, _dir) = gate();
        let err = gate.admit(Some("nope"), None, None).unwrap_err();
        assert_eq!(err, ErrorKind::Unauthenticated);
    }

    #[test]
    fn test_admission_happy_path() {
        let (gate, _dir) = gate();
        gate.create_tenant("acme", "key-1", Tier::Business, 1000).unwrap();

        let admission = gate.admit(Some("key-1"), Some(ChainId::Ethereum), Some("eth_call")).unwrap();
        assert_eq!(admission.tenant_id, "acme");
        assert_eq!(admission.tier, Tier::Business);
        assert!(admission.deadline > Instant::now());
        assert_eq!(gate.metrics.admitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_inactive_tenant_rejected() {
        let (gate, _dir) = gate();
        let mut record = gate.create_tenant("acme", "key-1", Tier::Pro, 1000).unwrap();
        record.active = false;
        gate.db.put_tenant(&record).unwrap();
        gate.tenants.insert(record.key_hash, record);

        assert_eq!(gate.admit(Some("key-1"), None, None).unwrap_err(), ErrorKind::Unauthenticated);
    }

    #[test]
    fn test_rate_limit_scenario() {
        // Free tier, rps=1 burst=1: 5 rapid requests yield 1 success.
        let mut config = GateConfig::default();
        config.tier_limits.insert(
            Tier::Free,
            TierLimits {
                rps: 1,
                burst: 1,
                concurrency: 8,
                deadline: std::time::Duration::from_secs(1),
            },
        );
        let (gate, _dir) = gate_with(config);
        gate.create_tenant("acme", "key-1", Tier::Free, 1000).unwrap();

        let mut successes = 0;
        let mut rate_limited = 0;
        for _ in 0..5 {
            match gate.admit(Some("key-1"), None, None) {
                Ok(_) => successes += 1,
                Err(ErrorKind::RateLimited { retry_after_ms }) => {
                    rate_limited += 1;
                    assert!(retry_after_ms <= 1000);
                }
                Err(other) => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(rate_limited, 4);
    }

    #[test]
    fn test_quota_exhaustion() {
        let (gate, _dir) = gate();
        gate.create_tenant("acme", "key-1", Tier::Enterprise, 2).unwrap();

        assert!(gate.admit(Some("key-1"), None, None).is_ok());
        assert!(gate.admit(Some("key-1"), None, None).is_ok());
        assert_eq!(gate.admit(Some("key-1"), None, None).unwrap_err(), ErrorKind::QuotaExhausted);
        assert_eq!(gate.quota_status("acme"), Some((0, 2)));
    }

    #[test]
    fn test_shed_levels() {
        let (gate, _dir) = gate();
        gate.create_tenant("free", "key-free", Tier::Free, 1000).unwrap();
        gate.create_tenant("pro", "key-pro", Tier::Pro, 1000).unwrap();
        gate.create_tenant("ent", "key-ent", Tier::Enterprise, 1000).unwrap();

        gate.set_shed_level(ShedLevel::ShedFree);
        assert_eq!(gate.admit(Some("key-free"), None, None).unwrap_err(), ErrorKind::Overloaded);
        assert!(gate.admit(Some("key-pro"), None, None).is_ok());

        gate.set_shed_level(ShedLevel::ShedPro);
        assert_eq!(gate.admit(Some("key-pro"), None, None).unwrap_err(), ErrorKind::Overloaded);
        assert!(gate.admit(Some("key-ent"), None, None).is_ok(), "enterprise is never shed");
    }

    #[test]
    fn test_concurrency_permits_release_on_drop() {
        let mut config = GateConfig::default();
        config.tier_limits.insert(
            Tier::Pro,
            TierLimits {
                rps: 1000,
                burst: 1000,
                concurrency: 1,
                deadline: std::time::Duration::from_secs(1),
            },
        );
        let (gate, _dir) = gate_with(config);
        gate.create_tenant("acme", "key-1", Tier::Pro, 1000).unwrap();

        let first = gate.admit(Some("key-1"), None, None).unwrap();
        assert_eq!(gate.admit(Some("key-1"), None, None).unwrap_err(), ErrorKind::Overloaded);
        drop(first);
        assert!(gate.admit(Some("key-1"), None, None).is_ok());
    }

    #[test]
    fn test_decisions_pure_over_snapshot() {
        let now = Utc::now();
        let record = TenantRecord {
            key_hash: [1; 32],
            tenant_id: "acme".to_string(),
            tier: Tier::Turbo,
            rate_limit_rps: None,
            burst: None,
            quota_remaining: 10,
            quota_month: now.format("%Y-%m").to_string(),
            quota_monthly_limit: 10,
            expires_at: None,
            active: true,
            created_at: now,
        };
        // Same snapshot and clock, same decision, every time.
        for _ in 0..10 {
            assert_eq!(evaluate_record(Some(&record), now), Ok(Tier::Turbo));
        }
        assert_eq!(evaluate_record(None, now), Err(ErrorKind::Unauthenticated));
    }

    #[test]
    fn test_audit_trail_written() {
        let (gate, _dir) = gate();
        gate.create_tenant("acme", "key-1", Tier::Pro, 1000).unwrap();
        let _ = gate.admit(Some("key-1"), Some(ChainId::Bitcoin), Some("getblockcount"));
        let _ = gate.admit(None, None, None);

        let records = gate.audit.drain(10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].decision, AuditDecision::Admitted);
        assert_eq!(records[0].method.as_deref(), Some("getblockcount"));
        assert_eq!(records[1].decision, AuditDecision::Unauthenticated);
    }

    #[test]
    fn test_request_log_written() {
        let (gate, _dir) = gate();
        gate.create_tenant("acme", "key-1", Tier::Pro, 1000).unwrap();
        gate.log_request(
            "acme",
            ChainId::Bitcoin,
            "getblockcount",
            true,
            Duration::from_micros(250),
            "ok",
        );

        let month = Utc::now().format("%Y%m").to_string();
        assert_eq!(gate.db.prune_request_log_month(&month).unwrap(), 1);
    }

    #[test]
    fn test_peer_handshake_roundtrip() {
        let (gate, _dir) = gate();
        let signer = PeerHandshake::new(SecureBuffer::from_slice(b"peer-secret").unwrap());
        let now = Utc::now().timestamp();
        let tag = signer.sign(b"nonce", now);

        assert!(gate.verify_peer_handshake(b"nonce", now, &tag).is_ok());
        assert!(gate.verify_peer_handshake(b"nonce", now - 60, &tag).is_err());
        assert!(gate.verify_peer_handshake(b"other", now, &tag).is_err());
    }
}
