//! # Error Handling
//!
//! This module defines the error taxonomy for the streaming core and how
//! errors are converted to HTTP responses on the management API.
//!
//! ## Error Categories:
//! - **Transport**: Connection drops and malformed binary frames. The device
//!   reconnects; the session moves to its grace window.
//! - **Protocol**: Out-of-order handshake, invalid JSON, duplicate utterance
//!   start. The device gets an `error` frame; repeated violations close the
//!   connection.
//! - **Processing**: An enhancement stage failed. The pipeline degrades to the
//!   last good stage output; never surfaced raw to the device.
//! - **Upstream**: A collaborator (STT/emotion/response/TTS) timed out or
//!   failed after its one retry.
//! - **Config / Validation / Internal**: Management-surface errors, kept from
//!   the original service skeleton.
//!
//! All errors are logged with session id, utterance id, and timestamp; logs
//! carry no PII beyond the device identifier.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Connection-level failure: drop, malformed frame, socket error
    Transport(String),

    /// Device violated the wire protocol (bad JSON, duplicate start, ...)
    Protocol(String),

    /// An enhancement stage failed; carries the stage name
    Processing { stage: String, message: String },

    /// An external collaborator failed after retry
    Upstream { service: String, message: String },

    /// Internal server errors
    Internal(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Input failed validation rules
    ValidationError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            AppError::Processing { stage, message } => {
                write!(f, "Processing error in stage '{}': {}", stage, message)
            }
            AppError::Upstream { service, message } => {
                write!(f, "Upstream error from '{}': {}", service, message)
            }
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Machine-readable error code used in `error` frames and JSON bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Transport(_) => "transport_error",
            AppError::Protocol(_) => "protocol_error",
            AppError::Processing { .. } => "processing_error",
            AppError::Upstream { .. } => "upstream_unavailable",
            AppError::Internal(_) => "internal_error",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
        }
    }

    /// Whether this error should tear down the device connection.
    ///
    /// Only transport failures kill the socket; everything else keeps the
    /// connection open and returns the session to IDLE.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}

/// Converts errors raised by management API handlers into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Protocol/ValidationError → 400 (Bad Request)
/// - Upstream → 502 (Bad Gateway)
/// - Transport/Processing/Internal/ConfigError → 500 (Internal Server Error)
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let status = match self {
            AppError::Protocol(_) | AppError::ValidationError(_) => {
                actix_web::http::StatusCode::BAD_REQUEST
            }
            AppError::Upstream { .. } => actix_web::http::StatusCode::BAD_GATEWAY,
            _ => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Anyhow errors from the config/boot path become internal errors.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing failures are protocol violations: the device (or a dashboard
/// client) sent something we cannot parse.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Protocol(format!("invalid JSON: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Transport("drop".into()).code(), "transport_error");
        assert_eq!(
            AppError::Upstream {
                service: "stt".into(),
                message: "timeout".into()
            }
            .code(),
            "upstream_unavailable"
        );
    }

    #[test]
    fn test_only_transport_is_fatal() {
        assert!(AppError::Transport("drop".into()).is_fatal_for_connection());
        assert!(!AppError::Protocol("dup start".into()).is_fatal_for_connection());
        assert!(!AppError::Processing {
            stage: "hpss".into(),
            message: "nan".into()
        }
        .is_fatal_for_connection());
    }

    #[test]
    fn test_json_error_is_protocol() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Protocol(_)));
    }
}
