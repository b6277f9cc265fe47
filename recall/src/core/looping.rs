//! Bounded repetition of an operation.

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::core::error::{ErrorKind, Failure, OpResult};
use crate::core::op::{Operation, SharedCondition, SharedOp};
use crate::core::state::{Scope, State};

/// Reason why a [`Loop`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoopStop {
    /// The convergence condition held after an iteration.
    Converged,
    /// The configured `max_iterations` were run.
    MaxIterations,
    /// The body reported a stall that survived its corrective attempt.
    Stalled,
}

/// Repeats `body` until convergence, the iteration cap, or a stall.
///
/// Events appended during iteration `i` are tagged `iteration=i`. Any failure
/// other than `StallDetected` stops the loop and propagates.
pub struct Loop {
    name: String,
    body: SharedOp,
    until: Option<SharedCondition>,
    max_iterations: u32,
}

impl Loop {
    pub fn new(body: SharedOp, max_iterations: u32) -> Self {
        Self {
            name: "Loop".to_string(),
            body,
            until: None,
            max_iterations,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn until(mut self, condition: SharedCondition) -> Self {
        self.until = Some(condition);
        self
    }

    fn converged(&self, state: &State) -> bool {
        self.until
            .as_ref()
            .is_some_and(|condition| condition.check(state))
    }
}

impl Operation for Loop {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: State) -> OpResult {
        let mut state = state;
        let mut iterations = 0u32;

        let stop = loop {
            if iterations >= self.max_iterations {
                break LoopStop::MaxIterations;
            }
            let start = state.trace.len();
            let scope = Scope::Iteration(iterations);
            debug!(looping = %self.name, iteration = iterations, "iteration");

            match self.body.run(state) {
                Ok(mut out) => {
                    out.trace.tag_since(start, scope);
                    state = out;
                    iterations += 1;
                    if self.converged(&state) {
                        break LoopStop::Converged;
                    }
                }
                Err(failure) => {
                    let (error, mut out) = failure.into_parts();
                    out.trace.tag_since(start, scope);
                    if error.kind() != ErrorKind::StallDetected {
                        return Err(Failure::new(error, out));
                    }
                    state = out;
                    iterations += 1;
                    break LoopStop::Stalled;
                }
            }
        };

        debug!(looping = %self.name, iterations, stop = ?stop, "loop finished");
        state.log(
            &self.name,
            json!({
                "iterations": iterations,
                "max_iterations": self.max_iterations,
                "stop": stop,
            }),
        );
        Ok(state)
    }
}
