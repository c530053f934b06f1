//! HTTP API error types.
//!
//! Every handler returns `Result<_, ApiError>`; the `IntoResponse` impl
//! renders `{ "error": "<message>" }` with the matching status code.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use td_core::crypto::CryptoError;
use td_core::otp::OtpError;
use td_core::store::StoreError;
use td_core::validation::ValidationError;
use td_harness::rate_limiter::RateLimitError;
use td_harness::security::SecurityError;
use td_integrations::storage::StorageError;
use td_intelligence::AssistantError;
use thiserror::Error;
use tracing::error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("too many requests, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// An integration the endpoint needs is not configured or not answering.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(what: &str) -> Self {
        ApiError::NotFound(format!("{what} not found"))
    }
}

// ---------------------------------------------------------------------------
// IntoResponse implementation
// ---------------------------------------------------------------------------

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Unavailable(m) => m.clone(),
            ApiError::RateLimited { .. } => self.to_string(),
            ApiError::InternalError(detail) => {
                error!(error = %detail, "internal error");
                "internal server error".to_string()
            }
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::not_found(&what),
            StoreError::Conflict(m) => ApiError::Conflict(m),
            StoreError::Invalid(m) => ApiError::BadRequest(m),
            StoreError::Database(m) => ApiError::InternalError(m),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<SecurityError> for ApiError {
    fn from(err: SecurityError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<CryptoError> for ApiError {
    fn from(err: CryptoError) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        ApiError::RateLimited {
            retry_after_secs: err.retry_after_secs(),
        }
    }
}

impl From<OtpError> for ApiError {
    fn from(err: OtpError) -> Self {
        match err {
            OtpError::Cooldown { retry_after_secs } => ApiError::RateLimited { retry_after_secs },
            OtpError::NotFound | OtpError::Expired => {
                ApiError::BadRequest("code expired or not requested, request a new one".into())
            }
            OtpError::Locked => {
                ApiError::BadRequest("too many wrong attempts, request a new code".into())
            }
            OtpError::Invalid { remaining } => {
                ApiError::BadRequest(format!("wrong code, {remaining} attempts left"))
            }
            OtpError::Store(e) => e.into(),
            OtpError::Crypto(e) => e.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnsupportedType(_) | StorageError::TooLarge { .. } | StorageError::Empty => {
                ApiError::BadRequest(err.to_string())
            }
            StorageError::NotConfigured(_) | StorageError::Api { .. } | StorageError::Http(_) => {
                ApiError::Unavailable(err.to_string())
            }
        }
    }
}

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        match err {
            AssistantError::EmptyMessage | AssistantError::Rejected(_) => {
                ApiError::BadRequest(err.to_string())
            }
            AssistantError::Provider(_) => ApiError::Unavailable(err.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn store_errors_map_to_statuses() {
        let cases = [
            (StoreError::NotFound("trip".into()), StatusCode::NOT_FOUND),
            (StoreError::Conflict("dup".into()), StatusCode::CONFLICT),
            (StoreError::Invalid("bad".into()), StatusCode::BAD_REQUEST),
            (StoreError::Database("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[tokio::test]
    async fn not_found_body() {
        let response = ApiError::from(StoreError::NotFound("trip".into())).into_response();
        assert_eq!(body_of(response).await["error"], "trip not found");
    }

    #[tokio::test]
    async fn internal_details_are_hidden() {
        let response = ApiError::InternalError("database is locked".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_of(response).await["error"], "internal server error");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let response = ApiError::from(OtpError::Cooldown { retry_after_secs: 42 }).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "42");
    }

    #[test]
    fn wrong_code_reports_remaining_attempts() {
        let err = ApiError::from(OtpError::Invalid { remaining: 2 });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("2 attempts left"));
    }
}
