use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PoolError;

/// Application error types
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid SQL: {0}")]
    InvalidSql(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_detail) = match self {
            AppError::Database(msg) => {
                let detail = ErrorDetail::new("DATABASE_ERROR", msg.clone());
                let detail = if msg.contains("partition") {
                    detail.with_details(
                        "The failing partition's predicate is included; retry with fewer partitions or fix the query.",
                    )
                } else {
                    detail
                };
                (StatusCode::INTERNAL_SERVER_ERROR, detail)
            }
            AppError::Connection(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorDetail::new("CONNECTION_ERROR", msg),
            ),
            AppError::InvalidSql(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("INVALID_SQL", msg)
                    .with_details("Only a single SELECT query is allowed."),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorDetail::new("VALIDATION_ERROR", msg),
            ),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorDetail::new("NOT_FOUND", msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ErrorDetail::new("CONFLICT", msg)),
            AppError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorDetail::new("POOL_EXHAUSTED", msg),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorDetail::new("INTERNAL_ERROR", msg),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_detail,
        });

        (status, body).into_response()
    }
}

impl From<PoolError> for AppError {
    fn from(err: PoolError) -> Self {
        let message = err.to_string();
        match err {
            PoolError::Configuration(_) | PoolError::InvalidArgument(_) => {
                AppError::Validation(message)
            }
            PoolError::InvalidSql(_) => AppError::InvalidSql(message),
            PoolError::PoolClosed => AppError::Conflict(message),
            PoolError::AcquireTimeout { .. } => AppError::Unavailable(message),
            PoolError::Connection(_) => AppError::Connection(message),
            PoolError::Execution { .. } => AppError::Database(message),
            PoolError::SchemaMismatch(_) | PoolError::RowCountMismatch { .. } => {
                AppError::Internal(message)
            }
        }
    }
}

/// Convert anyhow::Error to AppError
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_format() {
        let error = AppError::NotFound("Pool not found".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_detail_creation() {
        let detail = ErrorDetail::new("TEST_CODE", "Test message");
        assert_eq!(detail.code, "TEST_CODE");
        assert_eq!(detail.message, "Test message");
        assert!(detail.details.is_none());
    }

    #[test]
    fn test_pool_error_status_codes() {
        let status = |err: PoolError| AppError::from(err).into_response().status();
        assert_eq!(
            status(PoolError::InvalidArgument("partition_num".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(PoolError::InvalidSql("DELETE".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status(PoolError::PoolClosed), StatusCode::CONFLICT);
        assert_eq!(
            status(PoolError::AcquireTimeout {
                max_size: 2,
                timeout_ms: 10
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(PoolError::execution("boom").in_partition(1, Some("a >= 3"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
