//! Error types for phenixd

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use phenix_control::ControlError;
use serde::Serialize;
use thiserror::Error;

/// Daemon-level errors
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Server startup error
    #[error("Server error: {0}")]
    Server(String),

    /// Control plane error while bootstrapping
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// API-specific errors
#[derive(Debug, Error)]
pub enum ApiError {
    /// No usable credentials on the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Control plane error
    #[error(transparent)]
    Control(#[from] ControlError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Control(err) => match err {
                ControlError::Forbidden { .. } => (StatusCode::FORBIDDEN, "FORBIDDEN"),
                ControlError::PolicyConfigInvalid(_) => {
                    (StatusCode::FORBIDDEN, "POLICY_CONFIG_INVALID")
                }
                ControlError::Locked { .. } => (StatusCode::CONFLICT, "LOCKED"),
                ControlError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ControlError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
                ControlError::TimedOut { .. } => (StatusCode::GATEWAY_TIMEOUT, "TIMED_OUT"),
                ControlError::OperationFailed(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "OPERATION_FAILED")
                }
                ControlError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();

        let details = match &self {
            ApiError::Control(ControlError::Locked { key, status }) => Some(serde_json::json!({
                "key": key.to_string(),
                "status": status.to_string(),
            })),
            _ => None,
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API operations
pub type ApiResult<T> = Result<T, ApiError>;

/// Result type alias for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;
