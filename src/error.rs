//! Error handling module
//!
//! Error type of the ops router and its HTTP response conversion.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domain::ErrorKind;

/// Application-wide Result type
pub type AppResult<T> = Result<T, AppError>;

/// Errors returned by the ops router
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Metrics(_) => ErrorKind::Internal,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub retryable: bool,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = StatusCode::INTERNAL_SERVER_ERROR;

        // Internal details stay in the log
        tracing::error!(error = %self, "Request failed");

        let body = ErrorResponse {
            error: status
                .canonical_reason()
                .unwrap_or("Internal Server Error")
                .to_string(),
            error_code: "internal_error".to_string(),
            retryable: kind.is_retryable(),
        };

        (status, Json(body)).into_response()
    }
}
