//! The API error envelope.
//!
//! Every error response is `{"error": {"kind", "message", "retry_after_ms"?}}`
//! with the HTTP status fixed by the error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use sprint_core::ErrorKind;

/// Wrapper so `?` works in handlers.
#[derive(Debug)]
pub struct ApiError(pub ErrorKind);

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        ApiError(kind)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut error = json!({
            "kind": self.0.tag(),
            "message": self.0.to_string(),
        });
        if let Some(retry_after_ms) = self.0.retry_after_ms() {
            error["retry_after_ms"] = json!(retry_after_ms);
        }
        (status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let err = ApiError(ErrorKind::RateLimited { retry_after_ms: 750 });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn test_status_alignment() {
        for (kind, status) in [
            (ErrorKind::Unauthenticated, 401),
            (ErrorKind::QuotaExhausted, 402),
            (ErrorKind::DeadlineExceeded, 504),
            (ErrorKind::Overloaded, 503),
            (ErrorKind::bad_request("x"), 400),
            (ErrorKind::unsupported("x"), 501),
            (ErrorKind::upstream("x"), 502),
        ] {
            assert_eq!(ApiError(kind).into_response().status().as_u16(), status);
        }
    }
}
