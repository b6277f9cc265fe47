//! Retrieval quality against a case's relevant files.

use std::collections::BTreeSet;
use std::path::PathBuf;

use recall::core::state::State;
use serde::{Deserialize, Serialize};

use crate::judge::path_matches;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Score the distinct files among `state.candidates` against `relevant`.
///
/// Returns `None` when there is no ground truth.
pub fn score(state: Option<&State>, relevant: &[String]) -> Option<Retrieval> {
    if relevant.is_empty() {
        return None;
    }
    let retrieved: BTreeSet<PathBuf> = state
        .map(|state| {
            state
                .candidates
                .iter()
                .filter_map(|candidate| candidate.path())
                .collect()
        })
        .unwrap_or_default();

    let true_positives = retrieved
        .iter()
        .filter(|path| relevant.iter().any(|file| path_matches(path, file)))
        .count();
    let found = relevant
        .iter()
        .filter(|file| retrieved.iter().any(|path| path_matches(path, file)))
        .count();

    let precision = ratio(true_positives, retrieved.len());
    let recall = ratio(found, relevant.len());
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    Some(Retrieval {
        precision,
        recall,
        f1,
    })
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall::core::state::Candidate;

    fn state_with(uris: &[&str]) -> State {
        let mut state = State::new("q");
        for uri in uris {
            state.candidates.push(Candidate::new(*uri, "Grep"));
        }
        state
    }

    #[test]
    fn no_ground_truth_means_no_score() {
        assert_eq!(score(Some(&state_with(&["file:///a.md"])), &[]), None);
    }

    #[test]
    fn scores_distinct_files() {
        let state = state_with(&[
            "file:///docs/lease.md",
            "file:///docs/lease.md",
            "file:///docs/revenue.md",
        ]);
        let relevant = vec!["lease.md".to_string(), "tax.md".to_string()];
        let retrieval = score(Some(&state), &relevant).expect("score");
        assert_eq!(retrieval.precision, 0.5);
        assert_eq!(retrieval.recall, 0.5);
        assert_eq!(retrieval.f1, 0.5);
    }

    #[test]
    fn failed_run_scores_zero() {
        let retrieval = score(None, &["a.md".to_string()]).expect("score");
        assert_eq!(retrieval.precision, 0.0);
        assert_eq!(retrieval.recall, 0.0);
        assert_eq!(retrieval.f1, 0.0);
    }
}
