//! Core types shared across the Bitcoin Sprint gateway.
//!
//! Everything chain-agnostic lives here: chain identifiers, normalized
//! event shapes, the tier ladder, request fingerprints, the chain adapter
//! capability, the shared circuit breaker, and the client-facing error
//! taxonomy.

pub mod adapter;
pub mod breaker;
pub mod chain;
pub mod error;
pub mod fingerprint;
pub mod tier;
pub mod types;

pub use adapter::{adapter_for, ChainAdapter, EndpointConfig, EndpointKind, HeadAnnounce};
pub use breaker::{BreakerConfig, BreakerState, BreakerStats, CircuitBreaker};
pub use chain::ChainId;
pub use error::ErrorKind;
pub use fingerprint::{Fingerprint, TierClass};
pub use tier::{Tier, TierLimits};
pub use types::{BlockEvent, BlockHash, MempoolEntry, ObservationCounter, PeerId, TxId};
