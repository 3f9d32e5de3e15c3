//! RocksDB-backed key/value store.
//!
//! Column families:
//! - `tenants`: key_hash -> TenantRecord
//! - `audit`: big-endian nanos + counter -> AuditRecord (append-only)
//! - `reqlog`: "YYYYMM" + nanos + counter -> RequestLogRecord

use crate::models::{AuditRecord, RequestLogRecord, TenantRecord};
use crate::{Result, StorageError};
use chrono::Datelike;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

const CF_TENANTS: &str = "tenants";
const CF_AUDIT: &str = "audit";
const CF_REQLOG: &str = "reqlog";

pub struct GatewayDb {
    db: DB,
    /// Disambiguates records that land on the same nanosecond.
    append_counter: AtomicU32,
}

impl GatewayDb {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_TENANTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_AUDIT, Options::default()),
            ColumnFamilyDescriptor::new(CF_REQLOG, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cfs)?;
        info!(path = %path.as_ref().display(), "gateway store opened");
        Ok(Self { db, append_counter: AtomicU32::new(0) })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or(StorageError::ColumnFamilyMissing(name))
    }

    // ==================== Tenants ====================

    pub fn put_tenant(&self, record: &TenantRecord) -> Result<()> {
        let cf = self.cf(CF_TENANTS)?;
        self.db.put_cf(cf, record.key_hash, bincode::serialize(record)?)?;
        Ok(())
    }

    pub fn get_tenant(&self, key_hash: &[u8; 32]) -> Result<Option<TenantRecord>> {
        let cf = self.cf(CF_TENANTS)?;
        match self.db.get_cf(cf, key_hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_tenant(&self, key_hash: &[u8; 32]) -> Result<()> {
        let cf = self.cf(CF_TENANTS)?;
        self.db.delete_cf(cf, key_hash)?;
        Ok(())
    }

    pub fn list_tenants(&self) -> Result<Vec<TenantRecord>> {
        let cf = self.cf(CF_TENANTS)?;
        let mut tenants = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            tenants.push(bincode::deserialize(&value)?);
        }
        Ok(tenants)
    }

    /// Look a tenant up by its public id. Tenant counts are small enough
    /// that a scan beats maintaining a secondary index.
    pub fn find_tenant_by_id(&self, tenant_id: &str) -> Result<Option<TenantRecord>> {
        Ok(self.list_tenants()?.into_iter().find(|t| t.tenant_id == tenant_id))
    }

    // ==================== Audit log ====================

    pub fn append_audit(&self, record: &AuditRecord) -> Result<()> {
        let cf = self.cf(CF_AUDIT)?;
        let key = self.append_key(record.ts.timestamp_nanos_opt().unwrap_or(0));
        self.db.put_cf(cf, key, bincode::serialize(record)?)?;
        Ok(())
    }

    /// Most recent `limit` audit records, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let cf = self.cf(CF_AUDIT)?;
        let mut records = Vec::with_capacity(limit);
        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            if records.len() == limit {
                break;
            }
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    // ==================== Request log ====================

    pub fn append_request_log(&self, record: &RequestLogRecord) -> Result<()> {
        let cf = self.cf(CF_REQLOG)?;
        let month = format!("{:04}{:02}", record.ts.year(), record.ts.month());
        let mut key = month.into_bytes();
        key.extend_from_slice(&self.append_key(record.ts.timestamp_nanos_opt().unwrap_or(0)));
        self.db.put_cf(cf, key, bincode::serialize(record)?)?;
        Ok(())
    }

    /// Drop a whole monthly partition, `month` formatted `YYYYMM`.
    pub fn prune_request_log_month(&self, month: &str) -> Result<u64> {
        let cf = self.cf(CF_REQLOG)?;
        let mut pruned = 0u64;
        let prefix = month.as_bytes().to_vec();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if key.starts_with(&prefix) {
                self.db.delete_cf(cf, &key)?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    fn append_key(&self, nanos: i64) -> [u8; 12] {
        let counter = self.append_counter.fetch_add(1, Ordering::Relaxed);
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&(nanos as u64).to_be_bytes());
        key[8..].copy_from_slice(&counter.to_be_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditDecision;
    use chrono::{TimeZone, Utc};
    use sprint_core::{ChainId, Tier};

    fn test_tenant(id: &str, hash_byte: u8) -> TenantRecord {
        TenantRecord {
            key_hash: [hash_byte; 32],
            tenant_id: id.to_string(),
            tier: Tier::Business,
            rate_limit_rps: Some(50),
            burst: Some(100),
            quota_remaining: 5000,
            quota_month: "2026-08".to_string(),
            quota_monthly_limit: 5000,
            expires_at: None,
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_tenant_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = GatewayDb::open(dir.path()).unwrap();

        let tenant = test_tenant("acme", 1);
        db.put_tenant(&tenant).unwrap();

        let loaded = db.get_tenant(&[1; 32]).unwrap().unwrap();
        assert_eq!(loaded, tenant);
        assert!(db.get_tenant(&[9; 32]).unwrap().is_none());

        db.delete_tenant(&[1; 32]).unwrap();
        assert!(db.get_tenant(&[1; 32]).unwrap().is_none());
    }

    #[test]
    fn test_find_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let db = GatewayDb::open(dir.path()).unwrap();
        db.put_tenant(&test_tenant("acme", 1)).unwrap();
        db.put_tenant(&test_tenant("globex", 2)).unwrap();

        assert_eq!(db.find_tenant_by_id("globex").unwrap().unwrap().key_hash, [2; 32]);
        assert!(db.find_tenant_by_id("initech").unwrap().is_none());
    }

    #[test]
    fn test_audit_append_ordering() {
        let dir = tempfile::tempdir().unwrap();
        let db = GatewayDb::open(dir.path()).unwrap();

        for i in 0..5 {
            db.append_audit(&AuditRecord {
                ts: Utc.timestamp_opt(1_000_000 + i, 0).unwrap(),
                tenant_id: Some(format!("tenant-{i}")),
                decision: AuditDecision::Admitted,
                tier: Some(Tier::Pro),
                chain: Some(ChainId::Ethereum),
                method: Some("eth_blockNumber".to_string()),
            })
            .unwrap();
        }

        let recent = db.recent_audit(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].tenant_id.as_deref(), Some("tenant-4"));
        assert_eq!(recent[1].tenant_id.as_deref(), Some("tenant-3"));
    }

    #[test]
    fn test_request_log_monthly_prune() {
        let dir = tempfile::tempdir().unwrap();
        let db = GatewayDb::open(dir.path()).unwrap();

        let july = Utc.with_ymd_and_hms(2026, 7, 15, 12, 0, 0).unwrap();
        let august = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        for (ts, n) in [(july, 3), (august, 2)] {
            for i in 0..n {
                db.append_request_log(&RequestLogRecord {
                    ts,
                    tenant_id: format!("t-{i}"),
                    chain: ChainId::Bitcoin,
                    method: "getblockcount".to_string(),
                    cache_hit: true,
                    latency_us: 120,
                    outcome: "ok".to_string(),
                })
                .unwrap();
            }
        }

        assert_eq!(db.prune_request_log_month("202607").unwrap(), 3);
        assert_eq!(db.prune_request_log_month("202607").unwrap(), 0);
    }
}
