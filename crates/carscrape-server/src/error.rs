use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use carscrape_core::error::AppError;

use crate::dto::ErrorResponse;

/// Errors a handler can return.
pub enum ApiError {
    App(AppError),
    /// Malformed query or body detected by the handler itself.
    BadRequest(String),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self::App(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::BadRequest(message) => {
                let body = ErrorResponse {
                    error: "bad_request".to_string(),
                    message,
                };
                return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
            }
            ApiError::App(err) => err,
        };

        let (status, error_type) = match &err {
            AppError::InvalidTarget(_) => (StatusCode::BAD_REQUEST, "invalid_target"),
            AppError::SerializationError(_) => (StatusCode::BAD_REQUEST, "serialization_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::AlreadyTerminal { .. } => (StatusCode::CONFLICT, "already_terminal"),
            AppError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            AppError::ExtractionError(_) => (StatusCode::UNPROCESSABLE_ENTITY, "extraction_error"),
            AppError::Blocked(_) | AppError::HttpError(_) | AppError::NetworkError(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_error")
            }
            AppError::RateLimitExceeded => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded"),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            AppError::BrowserUnavailable(_) | AppError::PoolSaturated => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
            }
            AppError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: err.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
