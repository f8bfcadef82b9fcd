//! HTTP API Error Types
//!
//! Error envelope and conversions for the HTTP handlers.

use crate::index_manager::IndexError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// API error payload
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// HTTP API error that can be returned from handlers
#[derive(Debug)]
pub struct RestError {
    pub status: StatusCode,
    pub error: ApiError,
}

impl RestError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        RestError {
            status,
            error: ApiError {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    /// Retryable by the caller: the index is still rebuilding.
    pub fn not_ready(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "NOT_READY", message)
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.error
        }));
        (self.status, body).into_response()
    }
}

impl From<IndexError> for RestError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::UnknownType(name) => {
                RestError::not_found(format!("No configured type named '{name}'"))
            }
            IndexError::ReadyTimeout(index) => {
                RestError::not_ready(format!("Index '{index}' is still rebuilding"))
            }
            IndexError::Search(crate::search_client::SearchError::BadRequest(message)) => {
                RestError::bad_request(message)
            }
            other => RestError::internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type_maps_to_404() {
        let err: RestError = IndexError::UnknownType("nope".to_string()).into();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_ready_timeout_maps_to_503() {
        let err: RestError = IndexError::ReadyTimeout("idx".to_string()).into();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error.code, "NOT_READY");
    }

    #[test]
    fn test_engine_bad_request_maps_to_400() {
        let err: RestError = IndexError::Search(
            crate::search_client::SearchError::BadRequest("bad query".to_string()),
        )
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_envelope_shape() {
        let response = RestError::unauthorized("no groups").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
