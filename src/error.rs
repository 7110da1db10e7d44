//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - [`AppError`]: errors returned from plain HTTP handlers. They are converted to JSON
//!   HTTP responses through actix's `ResponseError` trait.
//! - [`SessionError`]: everything that can end (or merely disturb) a streaming assessment
//!   session. A session never turns these into HTTP responses; the terminal ones become a
//!   single `{"status":"error"}` frame on the WebSocket.

use crate::recognition::EngineError;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the HTTP side of the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **Forbidden**: Request from an origin that is not allowed (403 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// WebSocket upgrade from a disallowed origin
    Forbidden(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
        }
    }
}

/// Converts our custom errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "JSON parsing error: ...",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
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
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Forbidden(msg) => (
                actix_web::http::StatusCode::FORBIDDEN,
                "forbidden",
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

/// JSON parsing errors are almost always the client's fault, so they map to 400.
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

/// Failures observed while running one assessment session.
///
/// Every variant except [`SessionError::FrameProtocol`] is terminal: the session sends one
/// error frame (best effort) and tears down. Nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The first frame was not a usable configuration. The engine was never started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine refused the session (credentials, negotiation, connect timeout).
    #[error("engine start failed: {0}")]
    EngineStart(#[source] EngineError),

    /// The engine failed after the session started, or rejected an audio write.
    #[error("engine failure: {0}")]
    EngineRuntime(#[source] EngineError),

    /// The client connection failed or closed underneath the session.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An inbound frame that the protocol does not recognise. Logged and ignored.
    #[error("unrecognized frame: {0}")]
    FrameProtocol(String),

    /// The engine did not deliver its final result within the drain timeout.
    #[error("engine did not finish within {0} seconds")]
    DrainTimeout(u64),

    /// The server is at its session limit.
    #[error("server busy: {0}")]
    Capacity(String),

    /// A panic or other unexpected fault inside the session.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Whether this error ends the session.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionError::FrameProtocol(_))
    }

    /// Text placed in the `error` field of the outbound frame.
    ///
    /// Engine failures are passed through verbatim so clients can show the engine's
    /// message; configuration errors keep the "Invalid configuration" prefix that clients
    /// already match on.
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Config(msg) => format!("Invalid configuration: {}", msg),
            SessionError::EngineStart(err) | SessionError::EngineRuntime(err) => err.to_string(),
            SessionError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_status_codes() {
        let resp = AppError::BadRequest("nope".into()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let resp = AppError::Forbidden("origin".into()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_frame_protocol_errors_are_not_terminal() {
        assert!(!SessionError::FrameProtocol("{\"type\":\"pause\"}".into()).is_terminal());
        assert!(SessionError::Transport("closed".into()).is_terminal());
        assert!(SessionError::DrainTimeout(30).is_terminal());
    }

    #[test]
    fn test_client_message_passes_engine_text_through() {
        let err = SessionError::EngineRuntime(EngineError::Rejected {
            code: 4008,
            message: "audio too long".into(),
        });
        assert_eq!(err.client_message(), "engine rejected request (code 4008): audio too long");

        let err = SessionError::Config("ref_text is required".into());
        assert_eq!(err.client_message(), "Invalid configuration: ref_text is required");
    }
}
