//! Client-facing error taxonomy.
//!
//! Every internal failure that reaches a client maps onto one of these
//! kinds; transient upstream trouble is retried inside the relay and never
//! surfaces. The HTTP status mapping is fixed and part of the API contract.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced to clients, with their fixed HTTP status mapping.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing, invalid, or expired API key.
    #[error("missing or invalid API key")]
    Unauthenticated,

    /// Token bucket empty; retry after the indicated delay.
    #[error("rate limit exceeded, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// Monthly quota depleted.
    #[error("monthly quota exhausted")]
    QuotaExhausted,

    /// Lane full or global shed active.
    #[error("gateway overloaded")]
    Overloaded,

    /// Tier deadline elapsed before completion.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Chain or method circuit breaker is open.
    #[error("circuit open: {scope}")]
    CircuitOpen { scope: String },

    /// Upstream returned an error after bounded retries.
    #[error("upstream error: {message}")]
    Upstream { message: String },

    /// Malformed params or unknown method for the chain.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Chain/method combination not implemented.
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// A required entropy source is missing.
    #[error("entropy unavailable, missing sources: {missing_sources:?}")]
    EntropyUnavailable { missing_sources: Vec<String> },
}

impl ErrorKind {
    /// HTTP status code for this kind, per the API contract.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::RateLimited { .. } => 429,
            ErrorKind::QuotaExhausted => 402,
            ErrorKind::Overloaded => 503,
            ErrorKind::DeadlineExceeded => 504,
            ErrorKind::CircuitOpen { .. } => 503,
            ErrorKind::Upstream { .. } => 502,
            ErrorKind::BadRequest { .. } => 400,
            ErrorKind::Unsupported { .. } => 501,
            ErrorKind::EntropyUnavailable { .. } => 503,
        }
    }

    /// Stable snake_case tag, as serialized in the error envelope.
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::RateLimited { .. } => "rate_limited",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::CircuitOpen { .. } => "circuit_open",
            ErrorKind::Upstream { .. } => "upstream",
            ErrorKind::BadRequest { .. } => "bad_request",
            ErrorKind::Unsupported { .. } => "unsupported",
            ErrorKind::EntropyUnavailable { .. } => "entropy_unavailable",
        }
    }

    /// Retry hint, present only for rate limiting.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ErrorKind::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        ErrorKind::BadRequest { message: message.into() }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        ErrorKind::Unsupported { message: message.into() }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        ErrorKind::Upstream { message: message.into() }
    }

    pub fn circuit_open(scope: impl Into<String>) -> Self {
        ErrorKind::CircuitOpen { scope: scope.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::Unauthenticated.http_status(), 401);
        assert_eq!(ErrorKind::RateLimited { retry_after_ms: 100 }.http_status(), 429);
        assert_eq!(ErrorKind::QuotaExhausted.http_status(), 402);
        assert_eq!(ErrorKind::Overloaded.http_status(), 503);
        assert_eq!(ErrorKind::DeadlineExceeded.http_status(), 504);
        assert_eq!(ErrorKind::upstream("boom").http_status(), 502);
        assert_eq!(ErrorKind::bad_request("x").http_status(), 400);
        assert_eq!(ErrorKind::unsupported("x").http_status(), 501);
    }

    #[test]
    fn test_serialized_tag() {
        let err = ErrorKind::RateLimited { retry_after_ms: 250 };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "rate_limited");
        assert_eq!(json["retry_after_ms"], 250);
        assert_eq!(err.retry_after_ms(), Some(250));
    }

    #[test]
    fn test_entropy_missing_sources() {
        let err = ErrorKind::EntropyUnavailable {
            missing_sources: vec!["block_digest".to_string()],
        };
        assert_eq!(err.http_status(), 503);
        assert!(err.to_string().contains("block_digest"));
    }
}
