//! # Error Handling
//!
//! Two families of errors live here:
//!
//! - **ProtocolError**: everything that can go wrong inside one AudioHook session.
//!   Each variant maps to a machine-readable [`ErrorCode`] that travels on the wire
//!   in `error` control messages and is used to categorize load-test failures.
//! - **AppError**: errors returned by the diagnostic HTTP handlers, converted to
//!   JSON responses through actix's `ResponseError` trait.
//!
//! Protocol errors never cross the session boundary: the connection driver turns
//! them into an `error` frame plus a terminated session, and the rest of the
//! process keeps running.

use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// Machine-readable reason codes carried by `error` control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unparseable, incomplete or oversized frame
    MalformedFrame,
    /// Message not valid in the current session state
    ProtocolViolation,
    /// Sequence counter gap or regression
    SequenceError,
    /// Inactivity window or load-test deadline exceeded
    Timeout,
    /// The underlying connection failed to send or receive
    TransportFailure,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 5] = [
        ErrorCode::MalformedFrame,
        ErrorCode::ProtocolViolation,
        ErrorCode::SequenceError,
        ErrorCode::Timeout,
        ErrorCode::TransportFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedFrame => "malformed_frame",
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::SequenceError => "sequence_error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::TransportFailure => "transport_failure",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session-local protocol failures.
///
/// ## Fatality:
/// Every variant is fatal for the session that produced it and for nothing else.
/// None of them is retried: once sequence numbers or framing disagree, the two
/// peers no longer share a view of the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("sequence error: expected seq {expected}, got {actual}")]
    SequenceError { expected: u64, actual: u64 },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MalformedFrame(_) => ErrorCode::MalformedFrame,
            ProtocolError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            ProtocolError::SequenceError { .. } => ErrorCode::SequenceError,
            ProtocolError::Timeout(_) => ErrorCode::Timeout,
            ProtocolError::TransportFailure(_) => ErrorCode::TransportFailure,
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::MalformedFrame(format!("invalid control message: {}", err))
    }
}

/// Errors returned by the HTTP diagnostics API.
///
/// ## HTTP Status Code Mapping:
/// - NotFound → 404 (unknown session id)
/// - ServiceUnavailable → 503 (registry is draining for shutdown)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "Session abc is not active",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::NotFound(msg) => (
                actix_web::http::StatusCode::NOT_FOUND,
                "not_found",
                msg.clone(),
            ),
            AppError::ServiceUnavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
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

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_codes() {
        assert_eq!(
            ProtocolError::SequenceError { expected: 2, actual: 3 }.code(),
            ErrorCode::SequenceError
        );
        assert_eq!(
            ProtocolError::MalformedFrame("x".into()).code().as_str(),
            "malformed_frame"
        );
    }

    #[test]
    fn test_error_code_wire_names() {
        for code in ErrorCode::ALL {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_app_error_status() {
        let resp = AppError::NotFound("missing".into()).error_response();
        assert_eq!(resp.status(), actix_web::http::StatusCode::NOT_FOUND);
    }
}
