//! Fan-out over independent state copies with a deterministic merge.

use rayon::prelude::*;
use serde_json::json;
use tracing::debug;

use crate::core::error::{Failure, OpResult};
use crate::core::op::{Operation, SharedOp};
use crate::core::state::{Scope, State};

/// Runs each arm on its own copy of the state and merges the results.
///
/// Merge rules:
/// - `candidates`: each arm's full candidate list, concatenated in arm order.
/// - `trace`: the input trace, then each arm's new events tagged `branch=<k>`,
///   ordered by arm then by position within the arm.
/// - `query`, `evidence`, `answer`, `budget`: taken from the input state.
///
/// Arms run on the rayon pool unless [`Branch::sequential`] is set; results
/// are identical either way. The merge waits for every arm.
pub struct Branch {
    name: String,
    arms: Vec<SharedOp>,
    parallel: bool,
}

impl Branch {
    pub fn new(arms: Vec<SharedOp>) -> Self {
        Self {
            name: "Branch".to_string(),
            arms,
            parallel: true,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }
}

impl Operation for Branch {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: State) -> OpResult {
        debug!(branch = %self.name, arms = self.arms.len(), parallel = self.parallel, "fan-out");
        let outcomes: Vec<OpResult> = if self.parallel {
            self.arms
                .par_iter()
                .map(|arm| arm.run(state.clone()))
                .collect()
        } else {
            self.arms.iter().map(|arm| arm.run(state.clone())).collect()
        };

        let base_len = state.trace.len();
        let mut merged = state;
        merged.candidates = Vec::new();
        let mut counts = Vec::with_capacity(outcomes.len());
        let mut first_error = None;

        for (index, outcome) in outcomes.into_iter().enumerate() {
            let arm_state = match outcome {
                Ok(arm_state) => arm_state,
                Err(failure) => {
                    let (error, arm_state) = failure.into_parts();
                    first_error.get_or_insert(error);
                    arm_state
                }
            };
            counts.push(arm_state.candidates.len());
            merged.candidates.extend(arm_state.candidates);
            merged
                .trace
                .extend_scoped(arm_state.trace, base_len, Scope::Branch(index));
        }

        if let Some(error) = first_error {
            debug!(branch = %self.name, error = %error, "arm failed");
            return Err(Failure::new(error, merged));
        }

        let total = merged.candidates.len();
        merged.log(&self.name, json!({ "arms": counts, "candidates": total }));
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::stack::Stack;
    use crate::core::state::Candidate;
    use crate::test_support::{AddOneCandidate, AlwaysEmpty, FailingOp};

    fn adds(n: usize) -> SharedOp {
        Arc::new(Stack::new(
            (0..n)
                .map(|_| Arc::new(AddOneCandidate) as SharedOp)
                .collect(),
        ))
    }

    #[test]
    fn merged_length_is_sum_of_arm_counts_in_order() {
        for arms in 1..=5 {
            let branch = Branch::new((0..arms).map(|k| adds(k + 1)).collect());
            let state = branch.run(State::new("q")).expect("run");
            let expected: usize = (1..=arms).sum();
            assert_eq!(state.candidates.len(), expected);

            let arm_of: Vec<usize> = state
                .trace
                .iter()
                .filter_map(|event| event.branch())
                .collect();
            let mut sorted = arm_of.clone();
            sorted.sort_unstable();
            assert_eq!(arm_of, sorted, "events ordered by arm index");
        }
    }

    #[test]
    fn arms_start_from_copies_and_keep_input_candidates() {
        let mut state = State::new("q");
        state.candidates.push(Candidate::new("file:///seed", "seed"));
        state.evidence = Some("kept".to_string());
        let branch = Branch::new(vec![adds(1), Arc::new(AlwaysEmpty)]).sequential();
        let merged = branch.run(state).expect("run");
        let uris: Vec<&str> = merged
            .candidates
            .iter()
            .map(|candidate| candidate.uri.as_str())
            .collect();
        assert_eq!(uris[0], "file:///seed");
        assert_eq!(merged.candidates.len(), 2);
        assert_eq!(merged.evidence.as_deref(), Some("kept"));
    }

    #[test]
    fn parallel_and_sequential_merge_identically() {
        let arms = || vec![adds(2), adds(1), adds(3)];
        let parallel = Branch::new(arms()).run(State::new("q")).expect("parallel");
        let sequential = Branch::new(arms())
            .sequential()
            .run(State::new("q"))
            .expect("sequential");
        let shape = |state: &State| {
            state
                .trace
                .iter()
                .map(|event| (event.op.clone(), event.branch()))
                .collect::<Vec<_>>()
        };
        assert_eq!(shape(&parallel), shape(&sequential));
        assert_eq!(parallel.candidates.len(), sequential.candidates.len());
    }

    #[test]
    fn failing_arm_propagates_after_all_arms_finish() {
        let branch = Branch::new(vec![adds(1), Arc::new(FailingOp::transient("Broken")), adds(2)]);
        let failure = branch.run(State::new("q")).expect_err("arm failed");
        assert_eq!(failure.kind(), ErrorKind::TransientFailure);
        assert_eq!(failure.state.candidates.len(), 3);
        assert!(failure.trace().iter().any(|event| event.branch() == Some(2)));
    }
}
