//! Error taxonomy shared by repositories, services, and the HTTP surface.
//!
//! Repositories return typed errors; the routing layer maps them to status
//! codes via `IntoResponse`. Webhook delivery and background sweeps never
//! surface errors to callers.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{0}")]
    BadInput(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("lease is held by another worker")]
    NotOwner,

    #[error("task is not in progress")]
    NotInProgress,

    #[error("rate limited")]
    RateLimited { retry_after: Option<u64> },

    #[error("kv store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl QueueError {
    pub fn bad_input(msg: impl Into<String>) -> Self {
        Self::BadInput(msg.into())
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadInput(_) => "bad-input",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden(_) => "unauthorized",
            Self::NotFound(_) => "not-found",
            Self::NotOwner => "not-owner",
            Self::NotInProgress => "not-in-progress",
            Self::RateLimited { .. } => "rate-limited",
            Self::Kv(_) => "upstream-transient",
            Self::Internal(_) => "fatal-internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::NotOwner => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotInProgress => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Kv(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Internal detail stays in the logs, not on the wire.
        let message = if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut response =
            (status, Json(json!({ "error": self.code(), "message": message }))).into_response();

        if let Self::RateLimited {
            retry_after: Some(seconds),
        } = self
        {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_taxonomy_to_status_codes() {
        assert_eq!(
            QueueError::bad_input("negative delay").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            QueueError::Unauthenticated.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(QueueError::NotOwner.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            QueueError::NotFound("task").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            QueueError::NotInProgress.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            QueueError::RateLimited { retry_after: None }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(QueueError::NotOwner.code(), "not-owner");
        assert_eq!(QueueError::NotInProgress.code(), "not-in-progress");
        assert_eq!(QueueError::NotFound("task").code(), "not-found");
    }
}
