//! Error types.
//!
//! [`EngineError`] is what the storage engine reports. Resolver and
//! backend failures pass through untouched inside their variant, so
//! callers can still downcast to the original error. [`ApiError`] is the
//! upload host's HTTP error and implements
//! [`axum::response::IntoResponse`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Storage engine failure.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine cannot be built from the supplied options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A container-name, blob-name, metadata or content-settings resolver failed.
    #[error(transparent)]
    Resolution(anyhow::Error),

    /// The blob backend failed (container creation, upload, properties,
    /// signing or delete).
    #[error(transparent)]
    Transport(anyhow::Error),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "ConfigurationError",
            EngineError::Resolution(_) => "ResolutionError",
            EngineError::Transport(_) => "TransportError",
        }
    }
}

/// Upload host error.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request itself is malformed (bad multipart body, bad JSON).
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Engine(e) => e.kind(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(EngineError::Configuration(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(EngineError::Resolution(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(EngineError::Transport(_)) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
