/// Unified error types for Aurora ID
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the identity provider
#[derive(Error, Debug)]
pub enum IdpError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed or missing input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Bad credentials, missing or invalid session or token
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authenticated but forbidden
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Conflict errors (duplicate username, already enrolled TOTP)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// A time-boxed flow ran out (pending TOTP setup, authorization code)
    #[error("Expired: {0}")]
    Expired(String),

    /// Tampered signed parameters
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: std::time::Duration },

    /// Missing or malformed key material; aborts startup
    #[error("Startup error: {0}")]
    Startup(String),

    /// Record (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JWT errors
    #[error("JWT error: {0}")]
    Jwt(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IdpError {
    /// Stable error code reported to callers
    pub fn code(&self) -> &'static str {
        match self {
            IdpError::Validation(_) => "InvalidRequest",
            IdpError::Authentication(_) => "AuthenticationRequired",
            IdpError::Authorization(_) => "Forbidden",
            IdpError::Conflict(_) => "Conflict",
            IdpError::NotFound(_) => "NotFound",
            IdpError::Expired(_) => "Expired",
            IdpError::Integrity(_) => "InvalidSignature",
            IdpError::RateLimitExceeded { .. } => "RateLimitExceeded",
            _ => "InternalServerError",
        }
    }
}

/// Convert IdpError to HTTP response
impl IntoResponse for IdpError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            IdpError::Authentication(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            IdpError::Authorization(_) => (StatusCode::FORBIDDEN, self.to_string()),
            IdpError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            IdpError::Integrity(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            IdpError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            IdpError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            IdpError::Expired(_) => (StatusCode::GONE, self.to_string()),
            IdpError::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded".to_string(),
            ),
            _ => {
                tracing::error!("Request failed: {}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(), // Don't leak details
                )
            }
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for identity provider operations
pub type IdpResult<T> = Result<T, IdpError>;
