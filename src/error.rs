//! Error types for the Throttlegate service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Throttlegate operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No usable caller identity could be derived from the request
    #[error("Identity resolution error: {0}")]
    IdentityResolution(String),

    /// The counter store could not complete a read or write
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A stored value could not be interpreted as a counter
    #[error("Corrupt counter record under '{key}': {value:?}")]
    CorruptRecord { key: String, value: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThrottleError {
    /// HTTP status the dispatch gate answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ThrottleError::IdentityResolution(_) => StatusCode::BAD_REQUEST,
            ThrottleError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ThrottleError::Config(_)
            | ThrottleError::CorruptRecord { .. }
            | ThrottleError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ThrottleError::Config(_) => "CONFIG_ERROR",
            ThrottleError::IdentityResolution(_) => "IDENTITY_UNRESOLVED",
            ThrottleError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            ThrottleError::CorruptRecord { .. } => "CORRUPT_RECORD",
            ThrottleError::Io(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ThrottleError {
    fn into_response(self) -> Response {
        // Server-side details stay in the logs; clients only see the category.
        let message = match &self {
            ThrottleError::IdentityResolution(msg) => msg.clone(),
            ThrottleError::StoreUnavailable(_) => "rate limit store unavailable".to_string(),
            _ => "internal server error".to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (self.status_code(), body).into_response()
    }
}

/// Result type alias for Throttlegate operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
