//! Multi-source entropy generation.
//!
//! Three levels, each a strict superset of the one below:
//! - **Fast**: OS CSPRNG mixed with high-resolution timing jitter.
//!   Nonces, short-lived session tokens.
//! - **Hybrid**: Fast ⊕ recent block-header digests from the most-synced
//!   chain. API keys, long-lived tokens.
//! - **Enterprise**: Hybrid ⊕ host fingerprint ⊕ extra KDF rounds.
//!   Master and proof keys.
//!
//! A level either gets every source it requires or the request fails with
//! `EntropyUnavailable` naming the missing sources. There is no silent
//! downgrade.

use crate::secure_buffer::SecureBuffer;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sprint_core::ErrorKind;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Requested entropy strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntropyLevel {
    Fast,
    Hybrid,
    Enterprise,
}

impl EntropyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntropyLevel::Fast => "fast",
            EntropyLevel::Hybrid => "hybrid",
            EntropyLevel::Enterprise => "enterprise",
        }
    }
}

impl std::str::FromStr for EntropyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fast" => Ok(EntropyLevel::Fast),
            "hybrid" => Ok(EntropyLevel::Hybrid),
            "enterprise" => Ok(EntropyLevel::Enterprise),
            other => Err(format!("unknown entropy level: {other}")),
        }
    }
}

const DIGEST_FEED_DEPTH: usize = 8;
const ENTERPRISE_KDF_ROUNDS: usize = 4;

/// Rolling window of recent block-header digests, fed by the relay from
/// the most-synced chain and consumed by the Hybrid/Enterprise levels.
#[derive(Default)]
pub struct BlockDigestFeed {
    digests: RwLock<VecDeque<[u8; 32]>>,
}

impl BlockDigestFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, digest: [u8; 32]) {
        let mut digests = self.digests.write();
        if digests.len() == DIGEST_FEED_DEPTH {
            digests.pop_front();
        }
        digests.push_back(digest);
    }

    pub fn recent(&self) -> Vec<[u8; 32]> {
        self.digests.read().iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.read().is_empty()
    }
}

/// Multi-source entropy generator.
pub struct EntropyGenerator {
    digest_feed: Arc<BlockDigestFeed>,
    host_fingerprint: Option<[u8; 32]>,
}

impl EntropyGenerator {
    pub fn new(digest_feed: Arc<BlockDigestFeed>) -> Self {
        let host_fingerprint = host_fingerprint();
        if host_fingerprint.is_none() {
            debug!("host fingerprint unavailable, enterprise entropy disabled");
        }
        Self { digest_feed, host_fingerprint }
    }

    /// Fill `dst` with entropy at the requested level.
    ///
    /// Fails with `EntropyUnavailable` listing every missing source; never
    /// silently downgrades to a weaker level.
    pub fn fill_random(&self, level: EntropyLevel, dst: &mut SecureBuffer) -> Result<(), ErrorKind> {
        let mut missing = Vec::new();

        let mut seed = [0u8; 32];
        if OsRng.try_fill_bytes(&mut seed).is_err() {
            missing.push("os_rng".to_string());
        }

        let digests = if level != EntropyLevel::Fast {
            let recent = self.digest_feed.recent();
            if recent.is_empty() {
                missing.push("block_digest".to_string());
            }
            recent
        } else {
            Vec::new()
        };

        let fingerprint = if level == EntropyLevel::Enterprise {
            if self.host_fingerprint.is_none() {
                missing.push("hardware_fingerprint".to_string());
            }
            self.host_fingerprint
        } else {
            None
        };

        if !missing.is_empty() {
            return Err(ErrorKind::EntropyUnavailable { missing_sources: missing });
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(b"sprint-entropy");
        hasher.update(&[level as u8]);
        hasher.update(&seed);
        hasher.update(&timing_jitter());
        for digest in &digests {
            hasher.update(digest);
        }
        if let Some(fp) = fingerprint {
            hasher.update(&fp);
        }

        let mut key: [u8; 32] = *hasher.finalize().as_bytes();
        if level == EntropyLevel::Enterprise {
            // Extra mixing through a second hash family.
            use sha3::{Digest, Sha3_256};
            for round in 0..ENTERPRISE_KDF_ROUNDS {
                let mut kdf = Sha3_256::new();
                kdf.update(b"sprint-kdf");
                kdf.update([round as u8]);
                kdf.update(key);
                key = kdf.finalize().into();
            }
        }

        let mut reader = blake3::Hasher::new().update(&key).finalize_xof();
        dst.write_with(|bytes| reader.fill(bytes));
        key.iter_mut().for_each(|b| *b = 0);
        seed.iter_mut().for_each(|b| *b = 0);
        Ok(())
    }

    /// Sources currently available, for startup validation and `/health`.
    pub fn available_sources(&self) -> Vec<&'static str> {
        let mut sources = vec!["os_rng", "timing_jitter"];
        if !self.digest_feed.is_empty() {
            sources.push("block_digest");
        }
        if self.host_fingerprint.is_some() {
            sources.push("hardware_fingerprint");
        }
        sources
    }
}

/// Sample sub-microsecond scheduling jitter. Weak alone; only ever mixed.
fn timing_jitter() -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    let start = Instant::now();
    for i in 0u32..64 {
        let tick = start.elapsed().as_nanos() as u64;
        hasher.update(&tick.to_le_bytes());
        hasher.update(&i.to_le_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Stable per-host identifier from machine id, hostname, and CPU topology.
fn host_fingerprint() -> Option<[u8; 32]> {
    let machine_id = std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    if machine_id.is_none() && hostname.is_none() {
        return None;
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(b"sprint-host");
    if let Some(id) = machine_id {
        hasher.update(id.as_bytes());
    }
    if let Some(name) = hostname {
        hasher.update(name.as_bytes());
    }
    hasher.update(&(num_cpus::get() as u64).to_le_bytes());
    hasher.update(&(num_cpus::get_physical() as u64).to_le_bytes());
    Some(*hasher.finalize().as_bytes())
}
