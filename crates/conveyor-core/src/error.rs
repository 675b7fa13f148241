//! Step error taxonomy.
//!
//! Every business failure carries a `code`, a human-readable message, and a
//! `retryable` flag that decides whether the client is offered a resume.
//! Infrastructure faults (DB/KV transport) are deliberately NOT represented
//! here; they propagate as plain errors to the task runtime, which retries
//! them without touching the job row.

use serde_json::Value;
use std::fmt;

/// Well-known error codes. Backend failure bodies may carry their own codes,
/// so call sites treat codes as strings.
pub mod codes {
    pub const INVALID_FEATURE: &str = "INVALID_FEATURE";
    pub const MAX_STEP_ATTEMPTS: &str = "MAX_STEP_ATTEMPTS";
    pub const RESOURCE_EXHAUSTED: &str = "RESOURCE_EXHAUSTED";
    pub const SERVICE_TIMEOUT: &str = "SERVICE_TIMEOUT";
    pub const SERVICE_UNREACHABLE: &str = "SERVICE_UNREACHABLE";
    pub const SERVICE_HTTP_ERROR: &str = "SERVICE_HTTP_ERROR";
    pub const SERVICE_FAILED: &str = "SERVICE_FAILED";
    pub const BAD_RESPONSE: &str = "BAD_RESPONSE";
    pub const STUCK_DETECTED: &str = "STUCK_DETECTED";
    pub const LOOP_DETECTED: &str = "LOOP_DETECTED";
    pub const UNKNOWN_SERVICE: &str = "UNKNOWN_SERVICE";
}

/// A classified failure from a backend service call.
#[derive(Debug, Clone)]
pub struct ServiceCallError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// Raw error object from the response body, when one was present.
    pub details: Option<Value>,
}

impl ServiceCallError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ServiceCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ServiceCallError {}
