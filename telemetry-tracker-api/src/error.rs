use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use telemetry_tracker_core::{CoreError, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(msg) => ApiError::Validation(msg),
            CoreError::Serialization(msg) => ApiError::BadRequest(msg),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) | ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Client errors carry their detail; server errors only a generic message.
/// Logging server errors is the caller's job.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, details) = match self {
            ApiError::Validation(msg) => ("Validation error", Some(msg)),
            ApiError::BadRequest(msg) => ("Bad request", Some(msg)),
            ApiError::UnsupportedMediaType(msg) => ("Unsupported media type", Some(msg)),
            ApiError::NotFound(msg) => ("Resource not found", Some(msg)),
            ApiError::Internal(_) => ("Internal server error", None),
            ApiError::Store(_) => ("Failed to store event", None),
        };

        let mut response_json = json!({
            "error": message,
        });

        if let Some(details_msg) = details {
            response_json["details"] = json!(details_msg);
        }

        (status, Json(response_json)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
