//! Sequential composition.

use tracing::debug;

use crate::core::error::OpResult;
use crate::core::op::{Operation, SharedOp};
use crate::core::state::State;

/// Runs operations in declaration order, each on the previous one's output.
///
/// Fail-fast: the first failure aborts the rest and propagates with the trace
/// accumulated so far. Adds no trace event of its own.
pub struct Stack {
    name: String,
    ops: Vec<SharedOp>,
}

impl Stack {
    pub fn new(ops: Vec<SharedOp>) -> Self {
        Self::named("Stack", ops)
    }

    pub fn named(name: impl Into<String>, ops: Vec<SharedOp>) -> Self {
        Self {
            name: name.into(),
            ops,
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Operation for Stack {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: State) -> OpResult {
        self.ops.iter().enumerate().try_fold(state, |state, (index, op)| {
            debug!(stack = %self.name, index, op = op.name(), "stack step");
            op.run(state)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::error::ErrorKind;
    use crate::test_support::{AddOneCandidate, CountingOp, FailingOp};

    #[test]
    fn two_additions_yield_two_candidates_and_two_events() {
        let stack = Stack::new(vec![Arc::new(AddOneCandidate), Arc::new(AddOneCandidate)]);
        let state = stack.run(State::new("q")).expect("run");
        assert_eq!(state.candidates.len(), 2);
        assert_eq!(state.trace.len(), 2);
    }

    #[test]
    fn first_failure_aborts_remaining_ops() {
        let tail = Arc::new(CountingOp::new("Tail"));
        let stack = Stack::new(vec![
            Arc::new(AddOneCandidate),
            Arc::new(FailingOp::transient("Broken")),
            tail.clone(),
        ]);
        let failure = stack.run(State::new("q")).expect_err("fails");
        assert_eq!(failure.kind(), ErrorKind::TransientFailure);
        assert_eq!(tail.calls(), 0);
        let ops: Vec<&str> = failure.trace().iter().map(|event| event.op.as_str()).collect();
        assert_eq!(ops, vec!["AddOneCandidate", "Broken"]);
    }

    #[test]
    fn empty_stack_is_identity() {
        let stack = Stack::new(Vec::new());
        let state = stack.run(State::new("q")).expect("run");
        assert!(state.trace.is_empty());
    }
}
