//! # Error Handling
//!
//! Custom error types for the copilot backend and their HTTP mappings.
//!
//! ## Error Categories:
//! - **Backend**: transient failures reaching the completion backend (retryable)
//! - **MalformedOutput**: the backend returned text that failed schema validation
//! - **Transport**: a client or ASR connection dropped mid-session
//! - **Routing**: the router produced no valid capability selection
//! - **BadRequest / NotFound / ConfigError / Internal**: standard HTTP-facing errors
//!
//! Backend, MalformedOutput and Routing errors are contained at component
//! boundaries (annotation loop, report composer, dispatcher) and normally
//! never surface as HTTP responses; the mappings below exist for the REST
//! handlers that can still hit them directly.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Application error type shared across all components.
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (filesystem failures, lock poisoning, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Transient failure reaching the completion backend (timeout, connect error)
    Backend(String),

    /// Backend responded, but the output failed schema validation or JSON parsing
    MalformedOutput(String),

    /// A client or ASR transport connection failed
    Transport(String),

    /// The router returned no valid capability selection
    Routing(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Backend(msg) => write!(f, "Completion backend error: {}", msg),
            AppError::MalformedOutput(msg) => write!(f, "Malformed backend output: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Routing(msg) => write!(f, "Routing error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Converts errors to the JSON error body returned by the REST surface.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError/Transport → 500
/// - Backend/MalformedOutput → 502 (upstream produced the failure)
/// - BadRequest/Routing → 400
/// - NotFound → 404
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Backend(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "backend_error",
                msg.clone(),
            ),
            AppError::MalformedOutput(msg) => (
                actix_web::http::StatusCode::BAD_GATEWAY,
                "malformed_output",
                msg.clone(),
            ),
            AppError::Transport(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "transport_error",
                msg.clone(),
            ),
            AppError::Routing(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "routing_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::BadRequest(format!("Base64 decoding error: {}", err))
    }
}

/// `reqwest` failures are transient backend errors: the retry policies in the
/// annotation loop and report composer decide whether to try again.
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Backend(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = AppError::Backend("connection refused".to_string());
        assert_eq!(
            err.to_string(),
            "Completion backend error: connection refused"
        );

        let err = AppError::Routing("no selection".to_string());
        assert_eq!(err.to_string(), "Routing error: no selection");
    }

    #[test]
    fn test_reqwest_maps_to_backend() {
        // serde_json errors become BadRequest, not Backend
        let json_err: AppError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(json_err, AppError::BadRequest(_)));
    }
}
