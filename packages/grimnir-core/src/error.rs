//! Centralized error types for the Grimnir core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic JSON error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::executor::ExecutorPhase;

/// Application-wide error type for the Grimnir core runtime.
#[derive(Debug, Error)]
pub enum GrimnirError {
    /// An executor was asked to make a transition outside the allowed table.
    #[error("Invalid executor transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ExecutorPhase,
        to: ExecutorPhase,
    },

    /// No live session exists for the given id or token.
    #[error("Live session not found: {0}")]
    SessionNotFound(String),

    /// The live session exists but is not active.
    #[error("Live session not active: {0}")]
    SessionNotActive(String),

    /// The one-time session token was already consumed.
    #[error("Session token already used")]
    TokenUsed,

    /// The session token expired before it was consumed.
    #[error("Session token expired")]
    TokenExpired,

    /// No webstream exists for the given id.
    #[error("Webstream not found: {0}")]
    WebstreamNotFound(String),

    /// A webstream has an empty URL chain.
    #[error("Webstream has no URLs: {0}")]
    NoUrls(String),

    /// A webstream URL failed to parse.
    #[error("Invalid webstream URL: {0}")]
    InvalidUrl(String),

    /// The media engine is unreachable or refused the call.
    #[error("Media engine unavailable: {0}")]
    MediaEngineUnavailable(String),

    /// No mount exists for the given name or id.
    #[error("Mount not found: {0}")]
    MountNotFound(String),

    /// The harbor is at its configured source-connection cap.
    #[error("Maximum source connections exceeded")]
    MaxSourcesExceeded,

    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No station exists for the given id.
    #[error("Station not found: {0}")]
    StationNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database read or write failure.
    #[error("Database error: {0}")]
    Database(String),
}

impl GrimnirError {
    /// Returns a machine-readable error code for API responses and logs.
    ///
    /// Structured log lines carry this as `error.kind`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionNotActive(_) => "session_not_active",
            Self::TokenUsed => "token_used",
            Self::TokenExpired => "token_expired",
            Self::WebstreamNotFound(_) => "webstream_not_found",
            Self::NoUrls(_) => "no_urls",
            Self::InvalidUrl(_) => "invalid_url",
            Self::MediaEngineUnavailable(_) => "media_engine_unavailable",
            Self::MountNotFound(_) => "mount_not_found",
            Self::MaxSourcesExceeded => "max_sources_exceeded",
            Self::Unauthorized(_) => "unauthorized",
            Self::StationNotFound(_) => "station_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Io(_) => "io_error",
            Self::Database(_) => "database_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MountNotFound(_)
            | Self::StationNotFound(_)
            | Self::WebstreamNotFound(_)
            | Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) | Self::NoUrls(_) | Self::InvalidUrl(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) | Self::TokenUsed | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }
            Self::MaxSourcesExceeded | Self::MediaEngineUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::InvalidTransition { .. } | Self::SessionNotActive(_) => StatusCode::CONFLICT,
            Self::Io(_) | Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for GrimnirError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Convenient Result alias for application-wide operations.
pub type GrimnirResult<T> = Result<T, GrimnirError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for GrimnirError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}
