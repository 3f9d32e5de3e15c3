//! Persisted state for the gateway.
//!
//! Deliberately minimal: tenant records, an append-only audit log, and an
//! optional request log partitioned by month. No block or transaction
//! bodies are ever written here.

pub mod db;
pub mod models;

pub use db::GatewayDb;
pub use models::{AuditDecision, AuditRecord, RequestLogRecord, TenantRecord};

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("column family missing: {0}")]
    ColumnFamilyMissing(&'static str),
}

pub type Result<T> = std::result::Result<T, StorageError>;
