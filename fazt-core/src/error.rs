//! Error types and HTTP response conversion
//!
//! Every failure in the platform maps onto a stable, upper-snake error code
//! that is part of the HTTP contract. A 4xx/5xx response body always carries
//! exactly one top-level `error` object; success envelopes never mix with it.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the platform error
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification shared by the HTTP surface, the runtime
/// bridge, and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request
    BadRequest,
    /// Field-level validation failure
    ValidationFailed,
    /// Missing or invalid credential
    Unauthorized,
    /// Authenticated but not permitted
    Forbidden,
    /// Resource absent
    NotFound,
    /// Uniqueness or precondition violation
    Conflict,
    /// Exceeds a size limit
    PayloadTooLarge,
    /// Token bucket or concurrency breach
    RateLimitExceeded,
    /// Unexpected failure
    Internal,
    /// Admission denied; safe to retry
    ServiceUnavailable,
    /// Execution exceeded its time budget
    Timeout,
}

impl ErrorKind {
    /// The wire code for this kind. Codes are contract; never rename.
    pub fn code(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// HTTP status for this kind.
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest | Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether a client may retry the same request.
    pub fn retryable(self) -> bool {
        matches!(self, Self::RateLimitExceeded | Self::ServiceUnavailable)
    }
}

/// Main error type for the platform
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Field-level validation error
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Authentication error
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authorization error
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource conflict
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Size limit exceeded
    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// Execution exceeded its time budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Admission denied (pool full, queue full); retryable
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Egress proxy error with a `NET_*` code
    #[error("{0}")]
    Net(NetError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error into its stable kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Validation(_) => ErrorKind::ValidationFailed,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::PayloadTooLarge(_) => ErrorKind::PayloadTooLarge,
            Self::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unavailable(_) => ErrorKind::ServiceUnavailable,
            Self::Net(_) => ErrorKind::Internal,
            Self::Database(e) => {
                if is_busy(e) {
                    ErrorKind::ServiceUnavailable
                } else {
                    ErrorKind::Internal
                }
            }
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller may retry the same operation.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Net(e) => e.retryable,
            _ => self.kind().retryable(),
        }
    }
}

/// Transient "database is busy" detection for the retry policy.
///
/// SQLite surfaces lock contention as SQLITE_BUSY / SQLITE_LOCKED; sqlx maps
/// both onto `Database` errors whose message carries the lock wording.
pub fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

// ============================================================================
// Egress errors
// ============================================================================

/// Egress proxy error carrying a stable `NET_*` code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetError {
    /// Stable code: NET_BLOCKED, NET_TIMEOUT, NET_LIMIT, NET_BUDGET,
    /// NET_SIZE, NET_AUTH, NET_RATE, NET_ERROR
    pub code: &'static str,
    /// Human-readable message
    pub message: String,
    /// Whether the call may be retried
    pub retryable: bool,
    /// Seconds to wait before retrying, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl NetError {
    pub fn blocked(message: impl Into<String>) -> Self {
        Self { code: "NET_BLOCKED", message: message.into(), retryable: false, retry_after_secs: None }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self { code: "NET_TIMEOUT", message: message.into(), retryable: true, retry_after_secs: None }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Self { code: "NET_LIMIT", message: message.into(), retryable: true, retry_after_secs: None }
    }

    pub fn budget(message: impl Into<String>) -> Self {
        Self { code: "NET_BUDGET", message: message.into(), retryable: false, retry_after_secs: None }
    }

    pub fn size(message: impl Into<String>) -> Self {
        Self { code: "NET_SIZE", message: message.into(), retryable: false, retry_after_secs: None }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self { code: "NET_AUTH", message: message.into(), retryable: false, retry_after_secs: None }
    }

    pub fn rate(message: impl Into<String>, retry_after_secs: u64) -> Self {
        Self {
            code: "NET_RATE",
            message: message.into(),
            retryable: true,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self { code: "NET_ERROR", message: message.into(), retryable: false, retry_after_secs: None }
    }

    fn status(&self) -> StatusCode {
        match self.code {
            "NET_TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
            "NET_LIMIT" | "NET_RATE" => StatusCode::SERVICE_UNAVAILABLE,
            "NET_ERROR" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl std::fmt::Display for NetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<NetError> for Error {
    fn from(e: NetError) -> Self {
        Self::Net(e)
    }
}

// ============================================================================
// Envelope conversion
// ============================================================================

/// Error envelope body: `{"error": {"code", "message", "details"?}}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// The inner error object of the envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, body, retry_after) = match &self {
            Error::Net(e) => (
                e.status(),
                ErrorBody::new(e.code, e.message.clone()),
                e.retry_after_secs,
            ),
            Error::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorBody::new("RATE_LIMIT_EXCEEDED", "rate limit exceeded"),
                Some(*retry_after_secs),
            ),
            _ => {
                let kind = self.kind();
                // Internal detail stays in the logs; the wire carries a
                // generic message for 5xx kinds.
                let message = match kind {
                    ErrorKind::Internal => {
                        tracing::error!(error = %self, "internal error");
                        "internal error".to_string()
                    }
                    _ => self.to_string(),
                };
                let retry_after = if kind == ErrorKind::ServiceUnavailable {
                    Some(1)
                } else {
                    None
                };
                (kind.status(), ErrorBody::new(kind.code(), message), retry_after)
            }
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(Box::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(format!("invalid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(ErrorKind::BadRequest.code(), "BAD_REQUEST");
        assert_eq!(ErrorKind::ServiceUnavailable.code(), "SERVICE_UNAVAILABLE");
        assert_eq!(ErrorKind::RateLimitExceeded.code(), "RATE_LIMIT_EXCEEDED");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::ServiceUnavailable.retryable());
        assert!(ErrorKind::RateLimitExceeded.retryable());
        assert!(!ErrorKind::BadRequest.retryable());
        assert!(!ErrorKind::Internal.retryable());
    }

    #[test]
    fn test_net_error_retryability() {
        assert!(NetError::timeout("t").retryable);
        assert!(NetError::rate("r", 2).retryable);
        assert!(!NetError::blocked("b").retryable);
        assert!(!NetError::auth("a").retryable);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ErrorKind::ServiceUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new("NOT_FOUND", "missing");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["message"], "missing");
        assert!(json["error"].get("details").is_none());
        // exactly one top-level key
        assert_eq!(json.as_object().unwrap().len(), 1);
    }
}
