//! HMAC peer handshake for internal fan-out subscriptions.
//!
//! A subscribing peer proves possession of the shared peer secret by
//! presenting an HMAC-SHA256 tag over `(nonce, timestamp)`. Timestamps
//! outside the replay window are rejected before the tag is even checked.

use crate::secure_buffer::SecureBuffer;
use crate::CryptoError;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew for handshake timestamps.
pub const REPLAY_WINDOW: Duration = Duration::from_secs(30);

/// Handshake verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("timestamp outside replay window (skew {skew_secs} s)")]
    StaleTimestamp { skew_secs: i64 },

    #[error("handshake tag mismatch")]
    BadTag,
}

/// Verifier for the fan-out peer handshake. Holds the peer secret in a
/// SecureBuffer for its whole lifetime.
pub struct PeerHandshake {
    secret: SecureBuffer,
}

impl PeerHandshake {
    pub fn new(secret: SecureBuffer) -> Self {
        Self { secret }
    }

    /// Load the secret from an external reference: `env:NAME` or
    /// `file:/path`.
    pub fn from_secret_ref(secret_ref: &str) -> Result<Self, CryptoError> {
        let material = if let Some(name) = secret_ref.strip_prefix("env:") {
            std::env::var(name)
                .map_err(|_| CryptoError::SecretUnavailable(format!("env var {name} not set")))?
                .into_bytes()
        } else if let Some(path) = secret_ref.strip_prefix("file:") {
            std::fs::read(path)
                .map_err(|e| CryptoError::SecretUnavailable(format!("{path}: {e}")))?
        } else {
            return Err(CryptoError::SecretUnavailable(format!(
                "unsupported secret reference: {secret_ref}"
            )));
        };
        let secret = SecureBuffer::from_slice(&material)?;
        Ok(Self::new(secret))
    }

    /// Compute the tag for `(nonce, timestamp)`. Also used by test peers.
    pub fn sign(&self, nonce: &[u8], timestamp_secs: i64) -> [u8; 32] {
        self.secret.expose(|key| {
            let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key size");
            mac.update(nonce);
            mac.update(&timestamp_secs.to_be_bytes());
            mac.finalize().into_bytes().into()
        })
    }

    /// Verify a presented handshake at wall time `now_secs`.
    pub fn verify(
        &self,
        nonce: &[u8],
        timestamp_secs: i64,
        tag: &[u8],
        now_secs: i64,
    ) -> Result<(), HandshakeError> {
        let skew = now_secs - timestamp_secs;
        if skew.unsigned_abs() > REPLAY_WINDOW.as_secs() {
            return Err(HandshakeError::StaleTimestamp { skew_secs: skew });
        }

        self.secret.expose(|key| {
            let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key size");
            mac.update(nonce);
            mac.update(&timestamp_secs.to_be_bytes());
            mac.verify_slice(tag).map_err(|_| HandshakeError::BadTag)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> PeerHandshake {
        PeerHandshake::new(SecureBuffer::from_slice(b"test-peer-secret").unwrap())
    }

    #[test]
    fn test_roundtrip() {
        let hs = handshake();
        let tag = hs.sign(b"nonce-1", 1_000_000);
        assert!(hs.verify(b"nonce-1", 1_000_000, &tag, 1_000_010).is_ok());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let hs = handshake();
        let tag = hs.sign(b"nonce-1", 1_000_000);
        let err = hs.verify(b"nonce-1", 1_000_000, &tag, 1_000_031).unwrap_err();
        assert!(matches!(err, HandshakeError::StaleTimestamp { skew_secs: 31 }));

        // Future timestamps are just as suspect.
        let tag = hs.sign(b"nonce-1", 1_000_062);
        assert!(hs.verify(b"nonce-1", 1_000_062, &tag, 1_000_000).is_err());
    }

    #[test]
    fn test_wrong_nonce_rejected() {
        let hs = handshake();
        let tag = hs.sign(b"nonce-1", 1_000_000);
        assert_eq!(hs.verify(b"nonce-2", 1_000_000, &tag, 1_000_000), Err(HandshakeError::BadTag));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let hs = handshake();
        let other = PeerHandshake::new(SecureBuffer::from_slice(b"another-secret!!").unwrap());
        let tag = other.sign(b"nonce-1", 1_000_000);
        assert_eq!(hs.verify(b"nonce-1", 1_000_000, &tag, 1_000_000), Err(HandshakeError::BadTag));
    }

    #[test]
    fn test_secret_ref_env() {
        std::env::set_var("SPRINT_TEST_PEER_SECRET", "from-environment");
        let hs = PeerHandshake::from_secret_ref("env:SPRINT_TEST_PEER_SECRET").unwrap();
        let tag = hs.sign(b"n", 42);
        assert!(hs.verify(b"n", 42, &tag, 42).is_ok());

        assert!(PeerHandshake::from_secret_ref("vault:whatever").is_err());
        assert!(PeerHandshake::from_secret_ref("env:SPRINT_TEST_MISSING_VAR").is_err());
    }
}
