//! Error types and handling for the relay server.
//!
//! This module provides a unified error type [`AppError`] that wraps various error sources
//! and implements proper HTTP response conversion. Plain [`IntoResponse`] renders the
//! OpenAI envelope; [`AppError::into_protocol_response`] renders whichever envelope the
//! client protocol expects.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::transformer::{self, BackendError, RequestType, TranscodeError};

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_AUTH: &str = "authentication_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client. Timeouts become [`AppError::Timeout`].
    #[error("HTTP request error: {0}")]
    Request(reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Missing or unknown token
    #[error("Unauthorized")]
    Unauthorized,

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The backend engine reported an error for this request
    #[error("Backend error: {}", .0.message)]
    Backend(BackendError),

    /// A reply could not be expressed in the client protocol
    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    /// The upstream did not answer within the configured request timeout
    #[error("Gateway timeout")]
    Timeout,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Request(e) => e
                .status()
                .and_then(|status| StatusCode::from_u16(status.as_u16()).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Backend(_) => StatusCode::BAD_GATEWAY,
            AppError::Transcode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Protocol-neutral error payload; feeds every protocol's envelope.
    pub fn to_backend_error(&self) -> BackendError {
        match self {
            AppError::Backend(err) => err.clone(),
            AppError::Unauthorized => BackendError::new("Unauthorized").with_type(ERROR_TYPE_AUTH),
            AppError::BadRequest(msg) => {
                BackendError::new(msg.clone()).with_type(ERROR_TYPE_INVALID_REQUEST)
            }
            AppError::Timeout => BackendError::new("Gateway timeout").with_type(ERROR_TYPE_TIMEOUT),
            other => BackendError::new(other.to_string())
                .with_type(ERROR_TYPE_API)
                .with_code(other.status_code().as_u16().to_string()),
        }
    }

    /// Render the error in the envelope of the given client protocol.
    pub fn into_protocol_response(self, request_type: RequestType) -> Response {
        let status = self.status_code();
        let body = transformer::error_body(request_type, &self.to_backend_error());
        (status, Json(body)).into_response()
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout
        } else {
            AppError::Request(err)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.into_protocol_response(RequestType::ChatCompletions)
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = AppError::Unauthorized;
        assert_eq!(err.to_string(), "Unauthorized");

        let err = AppError::Internal("test error".to_string());
        assert_eq!(err.to_string(), "Internal server error: test error");

        let err = AppError::Backend(BackendError::new("rate limited"));
        assert_eq!(err.to_string(), "Backend error: rate limited");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            AppError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Backend(BackendError::new("x")).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_timeout_envelope() {
        let body = body_json(AppError::Timeout.into_protocol_response(RequestType::Messages)).await;
        assert_eq!(body["error"]["type"], ERROR_TYPE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_default_response_uses_openai_envelope() {
        let response = AppError::BadRequest("missing model".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "missing model");
        assert_eq!(body["error"]["type"], ERROR_TYPE_INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_anthropic_envelope() {
        let response = AppError::Unauthorized.into_protocol_response(RequestType::Messages);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], ERROR_TYPE_AUTH);
    }

    #[tokio::test]
    async fn test_responses_envelope() {
        let err = AppError::Backend(BackendError::new("boom").with_code("upstream_down"));
        let body = body_json(err.into_protocol_response(RequestType::Responses)).await;
        assert_eq!(body["type"], "error");
        assert_eq!(body["code"], "upstream_down");
        assert_eq!(body["message"], "boom");
    }

    #[test]
    fn test_error_from_anyhow() {
        let anyhow_err = anyhow::anyhow!("test error");
        let app_err: AppError = anyhow_err.into();
        assert!(matches!(app_err, AppError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let app_err: AppError = json_err.into();
        assert!(matches!(app_err, AppError::Serialization(_)));
        assert_eq!(app_err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_internal_error_carries_status_code() {
        let err = AppError::Internal("oops".into()).to_backend_error();
        assert_eq!(err.code.as_deref(), Some("500"));
        assert_eq!(err.error_type, ERROR_TYPE_API);
    }

    #[test]
    fn test_result_type_alias_error() {
        fn returns_error() -> Result<String> {
            Err(AppError::Unauthorized)
        }
        assert!(returns_error().is_err());
    }
}
