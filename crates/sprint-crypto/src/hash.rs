//! Digest helpers.

use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

/// SHA256 hash function
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Blake3 hash function
pub fn blake3_hash(data: &[u8]) -> Hash {
    let hash = blake3::hash(data);
    *hash.as_bytes()
}
