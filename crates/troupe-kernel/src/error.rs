//! Error taxonomy and failure classification.
//!
//! Execution failures travel as error-typed output records and are classified
//! into one of five [`ErrorClass`]es that drive retry, replan, or surface
//! decisions. Rust errors ([`KernelError`]) are reserved for programming and
//! infrastructure faults.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// KernelError
// ---------------------------------------------------------------------------

/// Errors surfaced by kernel types and the service contracts.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A status transition violated the step state machine.
    #[error("step {step_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        step_id: Uuid,
        from: String,
        to: String,
    },

    /// A step was completed with an empty result list.
    #[error("step {step_id}: completed with empty result")]
    EmptyResult { step_id: Uuid },

    /// A declared output had no corresponding result entry on completion.
    #[error("step {step_id}: declared output '{output}' missing from result")]
    MissingDeclaredOutput { step_id: Uuid, output: String },

    /// A plan description failed validation.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// An agent lifecycle transition was not permitted.
    #[error("agent {agent_id}: illegal lifecycle transition {from} -> {to}")]
    IllegalLifecycle {
        agent_id: Uuid,
        from: String,
        to: String,
    },

    /// A collaborator service failed.
    #[error("{service} failure: {message}")]
    Service { service: String, message: String },

    /// Persistence layer failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Delegation could not be completed.
    #[error("delegation failed: {0}")]
    Delegation(String),

    /// Serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KernelError {
    pub fn service(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
            message: message.into(),
        }
    }
}

/// Result alias used across the kernel contracts.
pub type KernelResult<T> = Result<T, KernelError>;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// Failure categories driving the scheduler's recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorClass {
    /// Network timeout, connection reset, 5xx, rate limit. Retried with
    /// exponential backoff up to `max_retries`.
    Transient,
    /// Input shape wrong. Replanned immediately, never retried as-is.
    Validation,
    /// Data-shape or missing-dependency error that may resolve after partial
    /// work finishes. Retried with a short delay up to
    /// `max_recoverable_retries`, then escalated as permanent.
    Recoverable,
    /// The step needs an answer from the user. Parked in `Waiting`.
    UserInputNeeded,
    /// Everything else. Triggers replan-from-failure.
    Permanent,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Validation => "validation",
            Self::Recoverable => "recoverable",
            Self::UserInputNeeded => "user_input_needed",
            Self::Permanent => "permanent",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// ErrorSignal and classification
// ---------------------------------------------------------------------------

/// Structured error codes recognised ahead of any status or message matching.
pub mod code {
    pub const TRANSIENT: &str = "transient";
    pub const VALIDATION: &str = "validation_error";
    pub const RECOVERABLE: &str = "recoverable";
    pub const USER_INPUT_NEEDED: &str = "user_input_required";
    pub const PERMANENT: &str = "permanent";
}

/// What the classifier sees about a failure: an optional structured code, an
/// optional HTTP status, and the message text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorSignal {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub message: String,
}

impl ErrorSignal {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            http_status: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Extract a signal from an arbitrary error payload: either a structured
    /// object `{code?, status?, message}` or a bare string.
    pub fn from_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => Self {
                code: map
                    .get("code")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                http_status: map
                    .get("status")
                    .or_else(|| map.get("http_status"))
                    .and_then(|v| v.as_u64())
                    .map(|s| s as u16),
                message: map
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            serde_json::Value::String(s) => Self::message(s.clone()),
            other => Self::message(other.to_string()),
        }
    }

    /// Classify this failure.
    ///
    /// Priority when multiple signals match: structured code, then HTTP
    /// status, then message pattern. Unknown errors default to
    /// [`ErrorClass::Recoverable`] so the system errs toward reflective
    /// recovery rather than hard failure.
    pub fn classify(&self) -> ErrorClass {
        if let Some(code) = &self.code
            && let Some(class) = classify_code(code)
        {
            return class;
        }
        if let Some(status) = self.http_status
            && let Some(class) = classify_http_status(status)
        {
            return class;
        }
        classify_message(&self.message)
    }
}

fn classify_code(code: &str) -> Option<ErrorClass> {
    let code = code.to_ascii_lowercase();
    match code.as_str() {
        code::TRANSIENT => Some(ErrorClass::Transient),
        code::VALIDATION => Some(ErrorClass::Validation),
        code::RECOVERABLE => Some(ErrorClass::Recoverable),
        code::USER_INPUT_NEEDED => Some(ErrorClass::UserInputNeeded),
        code::PERMANENT => Some(ErrorClass::Permanent),
        _ => None,
    }
}

fn classify_http_status(status: u16) -> Option<ErrorClass> {
    match status {
        408 | 429 | 500..=599 => Some(ErrorClass::Transient),
        400 | 422 => Some(ErrorClass::Validation),
        404 | 409 => Some(ErrorClass::Recoverable),
        401 | 403 => Some(ErrorClass::Permanent),
        _ => None,
    }
}

fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_ascii_lowercase();
    const TRANSIENT: &[&str] = &[
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "rate limit",
        "too many requests",
        "temporarily unavailable",
        "service unavailable",
    ];
    const VALIDATION: &[&str] = &[
        "validation",
        "invalid input",
        "schema",
        "required input",
        "missing required",
        "malformed",
    ];
    const USER_INPUT: &[&str] = &["user input", "needs clarification", "awaiting answer"];
    const PERMANENT: &[&str] = &["unauthorized", "forbidden", "unsupported verb", "not implemented"];

    if TRANSIENT.iter().any(|p| msg.contains(p)) {
        ErrorClass::Transient
    } else if VALIDATION.iter().any(|p| msg.contains(p)) {
        ErrorClass::Validation
    } else if USER_INPUT.iter().any(|p| msg.contains(p)) {
        ErrorClass::UserInputNeeded
    } else if PERMANENT.iter().any(|p| msg.contains(p)) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Recoverable
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
