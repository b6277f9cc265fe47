//! Progress detection with a single corrective retry.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::{Operation, SharedOp};
use crate::core::state::State;

/// Measurable size of a state, compared before and after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub candidates: usize,
    pub evidence_chars: usize,
}

impl Progress {
    pub fn of(state: &State) -> Self {
        Self {
            candidates: state.candidates.len(),
            evidence_chars: state.evidence_chars(),
        }
    }
}

/// How gain between two [`Progress`] snapshots is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GainMetric {
    /// Increase in candidate count.
    Candidates,
    /// Increase in evidence length, in characters.
    EvidenceChars,
    /// The larger of the two increases.
    #[default]
    Either,
}

impl GainMetric {
    pub fn gain(self, before: Progress, after: Progress) -> i64 {
        let candidates = delta(before.candidates, after.candidates);
        let evidence = delta(before.evidence_chars, after.evidence_chars);
        match self {
            GainMetric::Candidates => candidates,
            GainMetric::EvidenceChars => evidence,
            GainMetric::Either => candidates.max(evidence),
        }
    }
}

fn delta(before: usize, after: usize) -> i64 {
    let before = i64::try_from(before).unwrap_or(i64::MAX);
    let after = i64::try_from(after).unwrap_or(i64::MAX);
    after.saturating_sub(before)
}

/// Runs one iteration of `inner` and checks that it made progress.
///
/// When gain falls below `min_gain`, `on_stall` runs once and `inner` gets
/// exactly one more run. If that run is still below `min_gain`, the guard
/// returns a `StallDetected` failure carrying the state; it is non-fatal, and
/// the caller (usually a [`Loop`](crate::core::looping::Loop)) decides whether
/// to stop.
pub struct StagnationGuard {
    name: String,
    inner: SharedOp,
    on_stall: SharedOp,
    min_gain: i64,
    metric: GainMetric,
}

impl StagnationGuard {
    pub fn new(inner: SharedOp, on_stall: SharedOp) -> Self {
        Self {
            name: "StagnationGuard".to_string(),
            inner,
            on_stall,
            min_gain: 1,
            metric: GainMetric::default(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn min_gain(mut self, min_gain: i64) -> Self {
        self.min_gain = min_gain;
        self
    }

    pub fn metric(mut self, metric: GainMetric) -> Self {
        self.metric = metric;
        self
    }
}

impl Operation for StagnationGuard {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: State) -> OpResult {
        let before = Progress::of(&state);
        let mut out = self.inner.run(state)?;
        let gain = self.metric.gain(before, Progress::of(&out));
        if gain >= self.min_gain {
            out.log(
                &self.name,
                json!({ "outcome": "progress", "gain": gain, "metric": self.metric }),
            );
            return Ok(out);
        }

        debug!(guard = %self.name, gain, min_gain = self.min_gain, "stall suspected, correcting");
        let corrected = self.on_stall.run(out)?;
        let retry_before = Progress::of(&corrected);
        let mut out = self.inner.run(corrected)?;
        let recovery_gain = self.metric.gain(retry_before, Progress::of(&out));

        if recovery_gain >= self.min_gain {
            out.log(
                &self.name,
                json!({
                    "outcome": "recovered",
                    "gain": gain,
                    "recovery_gain": recovery_gain,
                    "corrective": self.on_stall.name(),
                    "metric": self.metric,
                }),
            );
            return Ok(out);
        }

        warn!(guard = %self.name, recovery_gain, "stalled after corrective step");
        out.log(
            &self.name,
            json!({
                "outcome": "stalled",
                "gain": gain,
                "recovery_gain": recovery_gain,
                "corrective": self.on_stall.name(),
                "metric": self.metric,
            }),
        );
        let error = OpError::StallDetected {
            op: self.name.clone(),
            gain: recovery_gain,
            min_gain: self.min_gain,
        };
        Err(Failure::new(error, out))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::state::Candidate;
    use crate::test_support::{AddOneCandidate, AlwaysEmpty, CountingOp, WarmupOp};

    #[test]
    fn either_metric_takes_larger_gain() {
        let before = Progress {
            candidates: 3,
            evidence_chars: 10,
        };
        let after = Progress {
            candidates: 2,
            evidence_chars: 40,
        };
        assert_eq!(GainMetric::Candidates.gain(before, after), -1);
        assert_eq!(GainMetric::EvidenceChars.gain(before, after), 30);
        assert_eq!(GainMetric::Either.gain(before, after), 30);
    }

    #[test]
    fn progress_passes_without_correction() {
        let corrective = Arc::new(CountingOp::new("Widen"));
        let guard = StagnationGuard::new(Arc::new(AddOneCandidate), corrective.clone());
        let state = guard.run(State::new("q")).expect("run");
        assert_eq!(corrective.calls(), 0);
        assert_eq!(state.trace.last().and_then(|e| e.outcome()), Some("progress"));
    }

    #[test]
    fn stall_runs_corrective_once_then_signals() {
        let corrective = Arc::new(CountingOp::new("Widen"));
        let mut state = State::new("q");
        state.candidates.push(Candidate::new("file:///a", "seed"));
        let guard = StagnationGuard::new(Arc::new(CountingOp::new("Idle")), corrective.clone());
        let failure = guard.run(state).expect_err("stalled");
        assert_eq!(failure.kind(), ErrorKind::StallDetected);
        assert_eq!(corrective.calls(), 1);
        assert_eq!(failure.trace().by_op("Idle").count(), 2);
        assert_eq!(failure.state.candidates.len(), 1);
    }

    #[test]
    fn corrective_attempt_can_recover() {
        let inner = Arc::new(WarmupOp::new("Warmup", 1));
        let guard = StagnationGuard::new(inner.clone(), Arc::new(AlwaysEmpty)).min_gain(1);
        let state = guard.run(State::new("q")).expect("recovered");
        assert_eq!(inner.calls(), 2);
        assert_eq!(state.trace.last().and_then(|e| e.outcome()), Some("recovered"));
    }
}
