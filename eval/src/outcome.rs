use recall::pipeline::RunStatus;
use serde::{Deserialize, Serialize};

use crate::judge::Judgment;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Fail,
    Degraded,
    Error,
}

/// `status` is `None` when the pipeline returned a failure.
pub fn classify_outcome(status: Option<RunStatus>, judgment: &Judgment) -> Outcome {
    match status {
        Some(RunStatus::Answered) => {
            if judgment.all_passed() {
                Outcome::Success
            } else {
                Outcome::Fail
            }
        }
        Some(RunStatus::Degraded) => Outcome::Degraded,
        None => Outcome::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::CheckOutcome;

    fn judgment(pass: bool) -> Judgment {
        Judgment {
            checks: vec![CheckOutcome::MinCandidates {
                count: 1,
                found: usize::from(pass),
                passed: pass,
            }],
        }
    }

    #[test]
    fn success_when_answered_and_checks_pass() {
        let outcome = classify_outcome(Some(RunStatus::Answered), &judgment(true));
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn fail_when_answered_but_checks_fail() {
        let outcome = classify_outcome(Some(RunStatus::Answered), &judgment(false));
        assert_eq!(outcome, Outcome::Fail);
    }

    #[test]
    fn degraded_regardless_of_checks() {
        let outcome = classify_outcome(Some(RunStatus::Degraded), &judgment(true));
        assert_eq!(outcome, Outcome::Degraded);
    }

    #[test]
    fn error_when_pipeline_failed() {
        let outcome = classify_outcome(None, &judgment(true));
        assert_eq!(outcome, Outcome::Error);
    }
}
