//! Wire-visible error codes and the error carrier they travel in.

use crate::message::Payload;
use serde::{Deserialize, Serialize};
use strand_core::Error;

/// Error kinds carried on the wire in `Error` and `StreamError` messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Service name did not resolve
    ServiceNotFound,
    /// Method did not resolve to a handler
    MethodNotFound,
    /// Parameters were malformed or of the wrong arity
    InvalidParameters,
    /// Payload encoding or decoding failed
    SerializationError,
    /// Stream production failed
    StreamError,
    /// Server-side deadline elapsed
    TimeoutError,
    /// Caller identity was not established
    AuthenticationError,
    /// Caller identity lacks permission
    AuthorizationError,
    /// Fallback for unmapped failures
    InternalError,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            ErrorCode::ServiceNotFound => -32000,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParameters => -32602,
            ErrorCode::SerializationError => -32003,
            ErrorCode::StreamError => -32005,
            ErrorCode::TimeoutError => -32001,
            ErrorCode::AuthenticationError => -32010,
            ErrorCode::AuthorizationError => -32011,
            ErrorCode::InternalError => -32603,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ErrorCode::ServiceNotFound => "Service not found",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParameters => "Invalid parameters",
            ErrorCode::SerializationError => "Serialization error",
            ErrorCode::StreamError => "Stream error",
            ErrorCode::TimeoutError => "Timeout",
            ErrorCode::AuthenticationError => "Authentication failed",
            ErrorCode::AuthorizationError => "Authorization failed",
            ErrorCode::InternalError => "Internal error",
        }
    }

    /// Nearest wire kind for a local failure; unmapped kinds fall back to
    /// `InternalError`
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::InvalidArgument(_) => ErrorCode::InvalidParameters,
            Error::Serialization(_) => ErrorCode::SerializationError,
            Error::Timeout => ErrorCode::TimeoutError,
            Error::NotFound(_) => ErrorCode::MethodNotFound,
            _ => ErrorCode::InternalError,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// A wire error before it is put into a message, or after it is taken out of
/// one.
#[derive(Debug, Clone)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Payload>,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Payload) -> Self {
        self.details = Some(details);
        self
    }

    pub fn service_not_found(service: &str) -> Self {
        Self::new(
            ErrorCode::ServiceNotFound,
            format!("Service '{}' not found", service),
        )
    }

    pub fn method_not_found(service: &str, method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method '{}.{}' not found", service, method),
        )
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParameters, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Convert a handler failure into its wire form
    pub fn from_error(error: &Error) -> Self {
        Self::new(ErrorCode::from_error(error), error.to_string())
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for WireError {}

impl From<WireError> for Error {
    fn from(err: WireError) -> Self {
        match err.code {
            ErrorCode::TimeoutError => Error::Timeout,
            ErrorCode::SerializationError => Error::Serialization(err.message),
            ErrorCode::ServiceNotFound | ErrorCode::MethodNotFound => Error::NotFound(err.message),
            ErrorCode::InvalidParameters => Error::InvalidArgument(err.message),
            _ => Error::Internal(format!("{}: {}", err.code, err.message)),
        }
    }
}
