//! The operation contract and the strategy values composites accept.
//!
//! Every unit of work, leaf or composite, implements [`Operation`]: take a
//! [`State`], return a [`State`] or a typed [`Failure`]. Composites hold their
//! children as [`SharedOp`], so any composite can wrap any other.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::state::{Query, State};

/// Uniform unit of work.
///
/// Implementations append exactly one trace event per invocation describing
/// their effect; pure sequencing composites add none of their own.
pub trait Operation: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, state: State) -> OpResult;
}

/// Operation shared between composites.
pub type SharedOp = Arc<dyn Operation>;

impl<T: Operation + ?Sized> Operation for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, state: State) -> OpResult {
        (**self).run(state)
    }
}

impl<T: Operation + ?Sized> Operation for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self, state: State) -> OpResult {
        (**self).run(state)
    }
}

/// Read-only predicate over state (post-conditions, convergence, gates).
///
/// Implementations carry immutable configuration only.
pub trait Condition: Send + Sync {
    fn name(&self) -> &str;
    fn check(&self, state: &State) -> bool;
}

/// Shared condition handle.
pub type SharedCondition = Arc<dyn Condition>;

/// At least `min` candidates are present.
#[derive(Debug, Clone, Copy)]
pub struct HasCandidates {
    pub min: usize,
}

impl Condition for HasCandidates {
    fn name(&self) -> &str {
        "has_candidates"
    }

    fn check(&self, state: &State) -> bool {
        state.candidates.len() >= self.min
    }
}

/// Evidence exists and has at least `min_chars` characters.
#[derive(Debug, Clone, Copy)]
pub struct HasEvidence {
    pub min_chars: usize,
}

impl Condition for HasEvidence {
    fn name(&self) -> &str {
        "has_evidence"
    }

    fn check(&self, state: &State) -> bool {
        state.evidence.is_some() && state.evidence_chars() >= self.min_chars
    }
}

/// An answer has been composed.
#[derive(Debug, Clone, Copy)]
pub struct HasAnswer;

impl Condition for HasAnswer {
    fn name(&self) -> &str {
        "has_answer"
    }

    fn check(&self, state: &State) -> bool {
        state.answer.is_some()
    }
}

/// Named plain function predicate.
#[derive(Debug, Clone, Copy)]
pub struct Predicate {
    pub name: &'static str,
    pub check: fn(&State) -> bool,
}

impl Condition for Predicate {
    fn name(&self) -> &str {
        self.name
    }

    fn check(&self, state: &State) -> bool {
        (self.check)(state)
    }
}

/// What an operation does when its precondition does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnUnmet {
    /// Pass the state through unchanged and log a skipped-precondition event.
    #[default]
    Skip,
    /// Fail with `PreconditionUnmet`.
    Fail,
}

/// Apply an operation's unmet-precondition policy.
pub fn unmet(mut state: State, op: &str, policy: OnUnmet, requirement: &str) -> OpResult {
    match policy {
        OnUnmet::Skip => {
            state.log(op, json!({ "skipped": "precondition", "requires": requirement }));
            Ok(state)
        }
        OnUnmet::Fail => Err(Failure::new(OpError::precondition(op, requirement), state)),
    }
}

/// Leaf wrapping a plain state transformation.
#[derive(Debug, Clone)]
pub struct FnOperation {
    name: String,
    apply: fn(State) -> State,
}

impl FnOperation {
    pub fn new(name: impl Into<String>, apply: fn(State) -> State) -> Self {
        Self {
            name: name.into(),
            apply,
        }
    }
}

impl Operation for FnOperation {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        state.log(&self.name, json!({ "fn": self.name }));
        Ok((self.apply)(state))
    }
}

/// Pipeline entry point: build the initial state from `query` and run `op`.
pub fn run_pipeline(op: &dyn Operation, query: impl Into<Query>) -> OpResult {
    run_with_state(op, State::new(query))
}

/// Run `op` on an existing state, absorbing non-fatal degradations.
///
/// `ResourceExhausted` and `StallDetected` that reach the top become a
/// best-effort result annotated with a `degraded` event; every other failure
/// is returned to the caller with the trace so far.
#[instrument(skip_all, fields(op = op.name()))]
pub fn run_with_state(op: &dyn Operation, state: State) -> OpResult {
    info!(query = %state.query.text, "pipeline started");
    match op.run(state) {
        Ok(state) => {
            info!(
                candidates = state.candidates.len(),
                events = state.trace.len(),
                "pipeline finished"
            );
            Ok(state)
        }
        Err(failure) if failure.error.is_degradation() => {
            let (error, mut state) = failure.into_parts();
            warn!(error = %error, "pipeline degraded");
            state.log(
                "pipeline",
                json!({
                    "outcome": "degraded",
                    "reason": error.kind(),
                    "detail": error.to_string(),
                }),
            );
            Ok(state)
        }
        Err(failure) => {
            warn!(error = %failure.error, "pipeline failed");
            Err(failure)
        }
    }
}
