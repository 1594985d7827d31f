//! HTTP error mapping.
//!
//! Every error body has the shape `{"error": "...", "request_id": "..."}`.
//! Rate-limit rejections additionally carry `limit`, `window`, and
//! `retry_after`, plus a `Retry-After` header.

use crate::request_id::current_request_id;
use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use nebuladb_core::NebulaError;
use serde_json::json;
use tracing::error;

/// Error returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid credentials
    Unauthorized(String),
    /// Malformed request that never reached the domain layer
    BadRequest(String),
    Nebula(NebulaError),
}

impl From<NebulaError> for ApiError {
    fn from(err: NebulaError) -> Self {
        ApiError::Nebula(err)
    }
}

/// HTTP status for a domain error.
pub fn status_for(err: &NebulaError) -> StatusCode {
    match err {
        NebulaError::NotFound(_) => StatusCode::NOT_FOUND,
        NebulaError::AccessDenied(_) => StatusCode::FORBIDDEN,
        NebulaError::ValidationError(_) => StatusCode::BAD_REQUEST,
        NebulaError::Conflict(_) => StatusCode::CONFLICT,
        NebulaError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        NebulaError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        NebulaError::Sqlite(_) | NebulaError::SerializationError(_) | NebulaError::Other(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Client-facing message. Internal failures are not described to callers.
fn public_message(err: &NebulaError) -> String {
    match err {
        NebulaError::NotFound(msg)
        | NebulaError::AccessDenied(msg)
        | NebulaError::ValidationError(msg)
        | NebulaError::Conflict(msg)
        | NebulaError::Unavailable(msg) => msg.clone(),
        NebulaError::RateLimited { .. } => "Rate limit exceeded".to_string(),
        NebulaError::Sqlite(_) | NebulaError::SerializationError(_) | NebulaError::Other(_) => {
            "Internal server error".to_string()
        }
    }
}

/// Format a window length the way rate-limit bodies report it.
pub fn format_window(window_secs: u64) -> String {
    format!("{}s", window_secs)
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Nebula(err) => status_for(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let request_id = current_request_id();

        let body = match &self {
            ApiError::Unauthorized(msg) | ApiError::BadRequest(msg) => json!({
                "error": msg,
                "request_id": request_id,
            }),
            ApiError::Nebula(NebulaError::RateLimited {
                limit,
                window_secs,
                retry_after_secs,
            }) => {
                let mut response = (
                    status,
                    Json(json!({
                        "error": "Rate limit exceeded",
                        "limit": limit,
                        "window": format_window(*window_secs),
                        "retry_after": retry_after_secs,
                        "request_id": request_id,
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(RETRY_AFTER, value);
                }
                return response;
            }
            ApiError::Nebula(err) => {
                if status.is_server_error() {
                    error!(request_id = %request_id, error = %err, "Request failed");
                }
                json!({
                    "error": public_message(err),
                    "request_id": request_id,
                })
            }
        };

        (status, Json(body)).into_response()
    }
}
