//! API Error Types
//!
//! Maps engine and metadata errors onto HTTP responses: input and
//! validation problems become 4xx, engine closure and cancellation
//! become 503 (retryable), everything else 500. Bodies carry a code,
//! the message, and a request id for correlation with the logs.

use crate::engine::EngineError;
use crate::meta::MetaError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl From<MetaError> for ApiError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotFound => ApiError::NotFound("record is not found".to_string()),
            MetaError::NameExists => ApiError::Conflict("query name already exists".to_string()),
            MetaError::BadArguments(m) => ApiError::BadRequest(m),
            MetaError::Query(e) => ApiError::BadRequest(e.to_string()),
            MetaError::Io(e) => ApiError::Internal(e.to_string()),
            MetaError::Corrupt(m) => ApiError::Internal(m),
        }
    }
}

/// Error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
    pub request_id: String,
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Engine(e) => match e {
                EngineError::EmptyRange => (StatusCode::NOT_FOUND, "EMPTY_RANGE"),
                EngineError::Query(_) | EngineError::BadArguments(_) => {
                    (StatusCode::BAD_REQUEST, "QUERY_ERROR")
                }
                EngineError::Cancelled | EngineError::Closed => {
                    (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR"),
            },
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(
            request_id = %request_id,
            error_code = %code,
            error_message = %self,
            "request failed"
        );

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message: self.to_string(),
            },
            request_id,
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
