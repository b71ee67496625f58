//! API error taxonomy.
//!
//! 4xx responses carry actionable detail; 5xx carry a correlation id and
//! nothing else — internals go to the log, keyed by that id.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use p8_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("{message}")]
    QuotaExceeded {
        resource: String,
        used: i64,
        limit: i64,
        message: String,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn quota(resource: &str, used: i64, limit: i64) -> Self {
        Self::QuotaExceeded {
            resource: resource.to_string(),
            used,
            limit,
            message: format!("{resource} quota exceeded ({used}/{limit})"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Dialect(e) => ApiError::BadRequest(e.to_string()),
            StoreError::UnknownTable(t) => ApiError::BadRequest(format!("unknown table: {t}")),
            StoreError::Invalid(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<p8_queue::QueueError> for ApiError {
    fn from(err: p8_queue::QueueError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<p8_crypto::CryptoError> for ApiError {
    fn from(err: p8_crypto::CryptoError) -> Self {
        ApiError::Internal(err.into())
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "bad_request", "detail": detail })),
            )
                .into_response(),
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED.into_response(),
            ApiError::Forbidden => StatusCode::FORBIDDEN.into_response(),
            ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
            ApiError::QuotaExceeded { resource, used, limit, message } => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "quota_exceeded",
                    "resource": resource,
                    "used": used,
                    "limit": limit,
                    "message": message,
                })),
            )
                .into_response(),
            ApiError::Internal(err) => {
                let correlation_id = p8_store::short_id("err-");
                error!(correlation_id = %correlation_id, error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal", "correlation_id": correlation_id })),
                )
                    .into_response()
            }
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_error_carries_structured_detail() {
        let err = ApiError::quota("chat_tokens", 26_000, 25_000);
        let ApiError::QuotaExceeded { used, limit, ref message, .. } = err else {
            panic!("expected quota error");
        };
        assert_eq!(used, 26_000);
        assert_eq!(limit, 25_000);
        assert!(message.contains("chat_tokens"));
    }

    #[test]
    fn dialect_errors_become_bad_requests() {
        let store_err = StoreError::Dialect(p8_store::DialectError::BlockedKeyword);
        let api_err: ApiError = store_err.into();
        assert!(matches!(api_err, ApiError::BadRequest(_)));
    }
}
