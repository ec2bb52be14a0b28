//! HTTP facing error type

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ingest::{CoordinatorError, MetricsError, PipelineError, SourceError, StoreError};

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Conflict { .. } => AppError::Conflict(err.to_string()),
            CoordinatorError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<eventlog_common::EventLogError> for AppError {
    fn from(err: eventlog_common::EventLogError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Validation(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Conflict(ref message) => (StatusCode::CONFLICT, message.clone()),
            AppError::Store(ref e) => {
                tracing::error!("Store error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            },
            AppError::Source(ref e) => {
                tracing::error!("Source error: {:?}", e);
                (StatusCode::BAD_GATEWAY, e.to_string())
            },
            AppError::Pipeline(ref e) => {
                tracing::error!("Pipeline error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{}: {}", e.kind(), e))
            },
            AppError::Metrics(ref e) => {
                tracing::error!("Metrics error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            },
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            },
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
