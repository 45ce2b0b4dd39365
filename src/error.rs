//! Error handling module
//!
//! Centralized error types and HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::event_store::EventStoreError;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Application error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Client errors (4xx)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Concurrent modification of {aggregate_id}: expected version {expected}, found {actual}")]
    OptimisticConcurrency {
        aggregate_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("Unique constraint {name} violated: {message}")]
    UniqueConstraint { name: String, message: String },

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    // Server errors (5xx)
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl AppError {
    /// Whether the caller may retry the operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::OptimisticConcurrency { .. } | AppError::Transient(_)
        )
    }
}

impl From<EventStoreError> for AppError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::OptimisticConcurrency {
                aggregate_id,
                expected,
                actual,
                ..
            } => AppError::OptimisticConcurrency {
                aggregate_id,
                expected,
                actual,
            },
            EventStoreError::UniqueConstraintViolation { name, value } => {
                AppError::UniqueConstraint {
                    name,
                    message: format!("value {value:?} is already taken"),
                }
            }
            EventStoreError::Serialization(e) => AppError::Serialization(e),
            EventStoreError::Database(e) => AppError::Database(e),
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = match &self {
            // 400 Bad Request
            AppError::InvalidInput(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_input", Some(msg.clone()))
            }
            AppError::Precondition(msg) => (
                StatusCode::BAD_REQUEST,
                "precondition_failed",
                Some(msg.clone()),
            ),

            // 403 Forbidden
            AppError::PermissionDenied(msg) => {
                (StatusCode::FORBIDDEN, "permission_denied", Some(msg.clone()))
            }

            // 404 Not Found
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, "not_found", Some(what.clone())),

            // 408 Request Timeout
            AppError::DeadlineExceeded => (StatusCode::REQUEST_TIMEOUT, "deadline_exceeded", None),

            // 409 Conflict
            AppError::OptimisticConcurrency { .. } => {
                (StatusCode::CONFLICT, "version_conflict", None)
            }
            AppError::UniqueConstraint { message, .. } => (
                StatusCode::CONFLICT,
                "unique_constraint_violation",
                Some(message.clone()),
            ),

            // 503 Service Unavailable
            AppError::Transient(msg) => {
                tracing::warn!("Transient failure: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "transient", None)
            }

            // 500 Internal Server Error
            AppError::Fatal(msg) => {
                tracing::error!("Fatal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "fatal", None)
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "database_error", None)
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", None)
            }
            AppError::Config(e) => {
                tracing::error!("Config error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "config_error", None)
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_code: error_code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let conflict = AppError::OptimisticConcurrency {
            aggregate_id: "user-1".to_string(),
            expected: 2,
            actual: 3,
        };
        assert!(conflict.is_retryable());
        assert!(AppError::Transient("db timeout".to_string()).is_retryable());
        assert!(!AppError::NotFound("user".to_string()).is_retryable());
        assert!(!AppError::Precondition("already inactive".to_string()).is_retryable());
    }

    #[test]
    fn test_unique_constraint_from_store_error() {
        let err = AppError::from(EventStoreError::UniqueConstraintViolation {
            name: "user.username".to_string(),
            value: "alice".to_string(),
        });
        match err {
            AppError::UniqueConstraint { name, .. } => assert_eq!(name, "user.username"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
