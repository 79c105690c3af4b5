//! Error types and HTTP response conversion
//!
//! The taxonomy below is deliberately small: each variant corresponds to one
//! of the error kinds in the propagation policy (validation, not-found,
//! conflict, dependency failure, handler error, timeout, cancellation), plus
//! a handful of infrastructure variants carried from the framework layer
//! (config, I/O, internal). Business errors are surfaced immediately;
//! infrastructure errors are retried by the caller where that makes sense.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type shared by every core subsystem
#[derive(Debug, ThisError)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Keyed store (Redis-equivalent) error
    #[error("keyed store error: {0}")]
    Redis(Box<redis::RedisError>),

    /// Relational store error
    #[error("database error: {0}")]
    Database(Box<sqlx::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input: unknown job type, missing required fields, bad
    /// payload shape. Surfaced to the caller; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing job id, scheduled id, or history entry.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic transaction failure or duplicate dedup marker.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The keyed store or relational store is unreachable. Rate limiting
    /// fails open, the export cache degrades to a miss, and the job engine
    /// surfaces this to the enqueue caller.
    #[error("dependency failure: {0}")]
    Dependency(String),

    /// A job handler raised a domain-level error. Retried with backoff up to
    /// `max_attempts`, then terminal.
    #[error("handler error: {0}")]
    Handler(String),

    /// A request or handler deadline elapsed. Counted as a handler failure
    /// for retry accounting.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Explicit cancellation by an admin, or implicit cancellation from
    /// shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Rate limit denied. Carries enough to populate `Retry-After`.
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Milliseconds the caller should wait before retrying
        retry_after_ms: u64,
        /// The limit that was exceeded
        limit: u32,
        /// Unix timestamp (seconds) the window resets at
        reset_at: i64,
    },

    /// Anything that doesn't fit the above; not expected to be common.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(Box::new(e))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Redis(Box::new(e))
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Database(Box::new(e))
    }
}

impl Error {
    /// True for errors that represent a transient dependency failure rather
    /// than a business-logic rejection. Used by the rate limiter and export
    /// cache to decide whether to fail open.
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Error::Dependency(_) | Error::Redis(_) | Error::Database(_))
    }
}

/// Error response body returned to HTTP callers
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,

    /// Machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// HTTP status code
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
            status: status.as_u16(),
        }
    }

    /// Create an error response with a machine-readable code
    pub fn with_code(status: StatusCode, code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: Some(code.into()),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Error::Config(e) => {
                tracing::error!(error = %e, "configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", "configuration error"),
                )
            }
            Error::Redis(e) => {
                tracing::error!(error = %e, "keyed store error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::with_code(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", "keyed store is unavailable"),
                )
            }
            Error::Database(e) => {
                tracing::error!(error = %e, "database error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::with_code(StatusCode::SERVICE_UNAVAILABLE, "DATABASE_UNAVAILABLE", "database is unavailable"),
                )
            }
            Error::Io(e) => {
                tracing::error!(error = %e, "io error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR", "internal I/O error"),
                )
            }
            Error::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_code(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
            ),
            Error::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_code(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ),
            Error::Conflict(msg) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(StatusCode::CONFLICT, "CONFLICT", msg),
            ),
            Error::Dependency(msg) => {
                tracing::error!(reason = %msg, "dependency failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::with_code(StatusCode::SERVICE_UNAVAILABLE, "DEPENDENCY_FAILURE", msg),
                )
            }
            Error::Handler(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "HANDLER_ERROR", msg),
            ),
            Error::Timeout(msg) => (
                StatusCode::GATEWAY_TIMEOUT,
                ErrorResponse::with_code(StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", msg),
            ),
            Error::Cancelled(msg) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_code(StatusCode::CONFLICT, "CANCELLED", msg),
            ),
            Error::RateLimited { retry_after_ms, limit, reset_at } => {
                let mut response = Json(ErrorResponse::with_code(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    "rate limit exceeded",
                ))
                .into_response();
                *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                let headers = response.headers_mut();
                if let Ok(v) = limit.to_string().parse() {
                    headers.insert("X-RateLimit-Limit", v);
                }
                if let Ok(v) = ((retry_after_ms / 1000).max(1)).to_string().parse() {
                    headers.insert("Retry-After", v);
                }
                if let Ok(v) = reset_at.to_string().parse() {
                    headers.insert("X-RateLimit-Reset", v);
                }
                return response;
            }
            Error::Internal(msg) => {
                tracing::error!(reason = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::with_code(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", "internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400() {
        let resp = Error::Validation("bad payload".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn not_found_maps_to_404() {
        let resp = Error::NotFound("job".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn conflict_maps_to_409() {
        let resp = Error::Conflict("dedup".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn dependency_maps_to_503() {
        let resp = Error::Dependency("redis down".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn rate_limited_sets_retry_after_header() {
        let resp = Error::RateLimited {
            retry_after_ms: 1500,
            limit: 3,
            reset_at: 1_700_000_000,
        }
        .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key("Retry-After"));
    }

    #[test]
    fn is_dependency_failure_classification() {
        assert!(Error::Dependency("x".into()).is_dependency_failure());
        assert!(!Error::Validation("x".into()).is_dependency_failure());
    }
}
