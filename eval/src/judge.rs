//! Check execution and outcome recording.
//!
//! Runs verification checks against the state a pipeline run returned.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use recall::core::state::State;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::case::Check;

/// Collected check outcomes for a run.
#[derive(Debug, Serialize, Deserialize)]
pub struct Judgment {
    pub checks: Vec<CheckOutcome>,
}

impl Judgment {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(CheckOutcome::passed)
    }
}

/// Result of running a single check.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckOutcome {
    AnswerContains {
        text: String,
        passed: bool,
    },
    FileHit {
        path: String,
        passed: bool,
    },
    MinCandidates {
        count: usize,
        found: usize,
        passed: bool,
    },
}

impl CheckOutcome {
    pub fn passed(&self) -> bool {
        match self {
            CheckOutcome::AnswerContains { passed, .. }
            | CheckOutcome::FileHit { passed, .. }
            | CheckOutcome::MinCandidates { passed, .. } => *passed,
        }
    }

    /// Stable label used to group outcomes across runs.
    pub fn label(&self) -> String {
        match self {
            CheckOutcome::AnswerContains { text, .. } => format!("answer_contains({text})"),
            CheckOutcome::FileHit { path, .. } => format!("file_hit({path})"),
            CheckOutcome::MinCandidates { count, .. } => format!("min_candidates({count})"),
        }
    }
}

/// Whether `candidate_path` names the file `relative` (compared by trailing components).
pub fn path_matches(candidate_path: &Path, relative: &str) -> bool {
    candidate_path.ends_with(relative)
}

/// Run all checks and collect outcomes.
///
/// A failed run has no state; every check fails against it.
#[instrument(skip_all, fields(check_count = checks.len()))]
pub fn run_checks(checks: &[Check], state: Option<&State>) -> Judgment {
    let mut outcomes = Vec::with_capacity(checks.len());
    for check in checks {
        let outcome = match check {
            Check::AnswerContains { text } => {
                let needle = text.to_lowercase();
                let passed = state
                    .and_then(|state| state.answer.as_deref())
                    .is_some_and(|answer| answer.to_lowercase().contains(&needle));
                CheckOutcome::AnswerContains {
                    text: text.clone(),
                    passed,
                }
            }
            Check::FileHit { path } => {
                let passed = state.is_some_and(|state| {
                    state
                        .candidates
                        .iter()
                        .filter_map(|candidate| candidate.path())
                        .any(|candidate| path_matches(&candidate, path))
                });
                CheckOutcome::FileHit {
                    path: path.clone(),
                    passed,
                }
            }
            Check::MinCandidates { count } => {
                let found = state.map_or(0, |state| state.candidates.len());
                CheckOutcome::MinCandidates {
                    count: *count,
                    found,
                    passed: found >= *count,
                }
            }
        };
        debug!(check = %outcome.label(), passed = outcome.passed(), "check result");
        outcomes.push(outcome);
    }
    Judgment { checks: outcomes }
}

pub fn write_judgment(path: &Path, judgment: &Judgment) -> Result<()> {
    let contents = serde_json::to_string_pretty(judgment).context("serialize checks")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
