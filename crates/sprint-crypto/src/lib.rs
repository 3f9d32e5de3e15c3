//! Credential and entropy core.
//!
//! Secrets in this gateway live in [`SecureBuffer`]s: locked against swap
//! where the platform allows it, zeroized before the memory is returned to
//! the allocator, and never exposed as a borrow that outlives the buffer.
//! The entropy generator layers OS randomness with chain digests and a
//! host fingerprint depending on the requested level.

pub mod entropy;
pub mod handshake;
pub mod hash;
pub mod secure_buffer;

pub use entropy::{BlockDigestFeed, EntropyGenerator, EntropyLevel};
pub use handshake::{HandshakeError, PeerHandshake, REPLAY_WINDOW};
pub use hash::{blake3_hash, sha256};
pub use secure_buffer::SecureBuffer;

/// Errors local to the crypto layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("zero-length secure buffer")]
    EmptyBuffer,

    #[error("destination size {dest} does not match buffer size {len}")]
    SizeMismatch { dest: usize, len: usize },

    #[error("secret material unavailable: {0}")]
    SecretUnavailable(String),
}
