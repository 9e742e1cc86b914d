//! Error model.
//!
//! [`Error`] is the wire-level error carried in `{"error": {...}}` response
//! envelopes. The remaining types are library errors: [`RegistrationError`]
//! for setup-phase misuse, [`ServeError`] for bus failures that terminate
//! serving, and [`ServiceError`] for runtime operations invoked at the wrong
//! time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error as ThisError;

// Canonical RES error codes.
pub const CODE_NOT_FOUND: &str = "system.notFound";
pub const CODE_METHOD_NOT_FOUND: &str = "system.methodNotFound";
pub const CODE_INVALID_PARAMS: &str = "system.invalidParams";
pub const CODE_INVALID_QUERY: &str = "system.invalidQuery";
pub const CODE_INTERNAL_ERROR: &str = "system.internalError";
pub const CODE_ACCESS_DENIED: &str = "system.accessDenied";
pub const CODE_TIMEOUT: &str = "system.timeout";

/// A RES protocol error as sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Error {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    /// Create an error with the given code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach additional error data.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `system.notFound` with its default message.
    pub fn not_found() -> Self {
        Self::new(CODE_NOT_FOUND, "Not found")
    }

    /// `system.methodNotFound` with its default message.
    pub fn method_not_found() -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, "Method not found")
    }

    /// `system.invalidParams`. An empty message falls back to the default.
    pub fn invalid_params(message: &str) -> Self {
        if message.is_empty() {
            Self::new(CODE_INVALID_PARAMS, "Invalid parameters")
        } else {
            Self::new(CODE_INVALID_PARAMS, message)
        }
    }

    /// `system.invalidQuery`. An empty message falls back to the default.
    pub fn invalid_query(message: &str) -> Self {
        if message.is_empty() {
            Self::new(CODE_INVALID_QUERY, "Invalid query")
        } else {
            Self::new(CODE_INVALID_QUERY, message)
        }
    }

    /// `system.internalError`. An empty message falls back to the default.
    pub fn internal_error(message: &str) -> Self {
        if message.is_empty() {
            Self::new(CODE_INTERNAL_ERROR, "Internal error")
        } else {
            Self::new(CODE_INTERNAL_ERROR, format!("Internal error: {}", message))
        }
    }

    /// `system.accessDenied` with its default message.
    pub fn access_denied() -> Self {
        Self::new(CODE_ACCESS_DENIED, "Access denied")
    }

    /// `system.timeout` with its default message.
    pub fn timeout() -> Self {
        Self::new(CODE_TIMEOUT, "Request timeout")
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

/// Setup-phase registration errors, raised before the service starts serving.
#[derive(Debug, ThisError)]
pub enum RegistrationError {
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("pattern '{0}' is already registered")]
    DuplicatePattern(String),

    #[error("handler option '{0}' is set more than once")]
    AlreadySet(&'static str),

    #[error("duplicate {kind} method '{method}'")]
    DuplicateMethod {
        kind: &'static str,
        method: String,
    },

    #[error("invalid method name: {0}")]
    InvalidMethodName(String),

    #[error("invalid group '{group}': {reason}")]
    InvalidGroup { group: String, reason: String },
}

/// Errors returned by [`Service::serve`](crate::Service::serve) and
/// [`Service::listen_and_serve`](crate::Service::listen_and_serve).
#[derive(Debug, ThisError)]
pub enum ServeError {
    #[error("service is already serving")]
    AlreadyServing,

    #[error(transparent)]
    Bus(#[from] crate::bus::BusError),
}

/// Errors from runtime service operations.
#[derive(Debug, ThisError)]
pub enum ServiceError {
    #[error("service is not serving")]
    NotServing,

    #[error("no registered pattern matches resource {0}")]
    NoMatchingPattern(String),
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
