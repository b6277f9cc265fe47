//! Typed failures raised by operations.
//!
//! Recovery policy lives in the composites; this module only classifies.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::state::{Resource, State, Trace};

/// Failure taxonomy shared by every operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpError {
    #[error("{op}: precondition unmet: {requirement}")]
    PreconditionUnmet { op: String, requirement: String },
    #[error("{op}: timed out after {after:?}")]
    Timeout { op: String, after: Duration },
    #[error("{op}: {resource} budget exhausted")]
    ResourceExhausted { op: String, resource: Resource },
    #[error("{op}: transient failure: {message}")]
    TransientFailure { op: String, message: String },
    #[error("{op}: logic error: {message}")]
    LogicError { op: String, message: String },
    #[error("{op}: no progress (gain {gain} below {min_gain})")]
    StallDetected { op: String, gain: i64, min_gain: i64 },
}

/// Discriminant of [`OpError`], used in trace payloads and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PreconditionUnmet,
    Timeout,
    ResourceExhausted,
    TransientFailure,
    LogicError,
    StallDetected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::PreconditionUnmet => "precondition-unmet",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceExhausted => "resource-exhausted",
            ErrorKind::TransientFailure => "transient-failure",
            ErrorKind::LogicError => "logic-error",
            ErrorKind::StallDetected => "stall-detected",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OpError {
    pub fn transient(op: &str, err: impl fmt::Display) -> Self {
        OpError::TransientFailure {
            op: op.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub fn logic(op: &str, message: impl Into<String>) -> Self {
        OpError::LogicError {
            op: op.to_string(),
            message: message.into(),
        }
    }

    pub fn precondition(op: &str, requirement: impl Into<String>) -> Self {
        OpError::PreconditionUnmet {
            op: op.to_string(),
            requirement: requirement.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::PreconditionUnmet { .. } => ErrorKind::PreconditionUnmet,
            OpError::Timeout { .. } => ErrorKind::Timeout,
            OpError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            OpError::TransientFailure { .. } => ErrorKind::TransientFailure,
            OpError::LogicError { .. } => ErrorKind::LogicError,
            OpError::StallDetected { .. } => ErrorKind::StallDetected,
        }
    }

    /// Name of the operation that raised the error.
    pub fn op(&self) -> &str {
        match self {
            OpError::PreconditionUnmet { op, .. }
            | OpError::Timeout { op, .. }
            | OpError::ResourceExhausted { op, .. }
            | OpError::TransientFailure { op, .. }
            | OpError::LogicError { op, .. }
            | OpError::StallDetected { op, .. } => op,
        }
    }

    /// Errors a self-healing wrapper may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OpError::TransientFailure { .. } | OpError::PreconditionUnmet { .. }
        )
    }

    /// Errors that must never propagate through a recovery wrapper.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OpError::LogicError { .. })
    }

    /// Errors that shorten a run instead of failing it.
    pub fn is_degradation(&self) -> bool {
        matches!(
            self,
            OpError::ResourceExhausted { .. } | OpError::StallDetected { .. }
        )
    }
}

/// An [`OpError`] together with the state at the point of failure.
///
/// The state carries the full trace accumulated so far, so a caller that
/// receives a terminal failure can still print what ran.
#[derive(Debug, thiserror::Error)]
#[error("pipeline step failed")]
pub struct Failure {
    #[source]
    pub error: OpError,
    pub state: Box<State>,
}

impl Failure {
    pub fn new(error: OpError, state: State) -> Self {
        Self {
            error,
            state: Box::new(state),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn trace(&self) -> &Trace {
        &self.state.trace
    }

    pub fn into_parts(self) -> (OpError, State) {
        (self.error, *self.state)
    }
}

/// Result of running one operation.
pub type OpResult = Result<State, Failure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification_follows_taxonomy() {
        assert!(OpError::transient("grep", "io").is_retryable());
        assert!(OpError::precondition("concat", "candidates").is_retryable());
        assert!(!OpError::logic("grep", "bug").is_retryable());
        assert!(OpError::logic("grep", "bug").is_fatal());
        let exhausted = OpError::ResourceExhausted {
            op: "llm".to_string(),
            resource: Resource::Tokens,
        };
        assert!(!exhausted.is_retryable());
        assert!(exhausted.is_degradation());
        let timeout = OpError::Timeout {
            op: "grep".to_string(),
            after: Duration::from_secs(2),
        };
        assert!(!timeout.is_retryable() && !timeout.is_fatal() && !timeout.is_degradation());
    }

    #[test]
    fn failure_keeps_trace_and_reports_kind() {
        let mut state = State::new("q");
        state.log("grep", serde_json::json!({"matches": 0}));
        let failure = Failure::new(OpError::transient("grep", "spawn failed"), state);
        assert_eq!(failure.kind(), ErrorKind::TransientFailure);
        assert_eq!(failure.trace().len(), 1);
        assert_eq!(
            failure.error.to_string(),
            "grep: transient failure: spawn failed"
        );
    }
}
