//! Retry, fallback and post-condition recovery around one operation.
//!
//! [`SelfHeal`] is a bounded state machine: an attempt counter, a named
//! [`Backoff`] policy and three terminal outcomes ([`HealOutcome`]). A weak or
//! failed result is never raised on its own; the wrapper either recovers, runs
//! the fallback, or hands back the last state marked `unhealed`.

use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::{Operation, SharedCondition, SharedOp};
use crate::core::state::State;

/// Delay before a retry, as a function of the retry number (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Wait the same duration before every retry.
    Fixed(Duration),
    /// Wait `base * 2^(retry - 1)`, never longer than `cap`.
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// Result of one attempt of the inner operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    /// Ran and satisfied the post-condition.
    Healed,
    /// Ran but did not satisfy the post-condition.
    Weak,
    /// Raised a recoverable error.
    Failed,
}

/// How a [`SelfHeal`] invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealOutcome {
    Healed,
    FallbackUsed,
    Unhealed,
}

pub struct SelfHeal {
    name: String,
    inner: SharedOp,
    retries: u32,
    backoff: Backoff,
    fallback: Option<SharedOp>,
    post_condition: Option<SharedCondition>,
    on_weak: Option<SharedOp>,
}

impl SelfHeal {
    /// Wrap `inner` with no retries, no fallback and an always-true post-condition.
    pub fn new(inner: SharedOp) -> Self {
        Self {
            name: "SelfHeal".to_string(),
            inner,
            retries: 0,
            backoff: Backoff::None,
            fallback: None,
            post_condition: None,
            on_weak: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn fallback(mut self, fallback: SharedOp) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn post_condition(mut self, condition: SharedCondition) -> Self {
        self.post_condition = Some(condition);
        self
    }

    pub fn on_weak(mut self, refine: SharedOp) -> Self {
        self.on_weak = Some(refine);
        self
    }

    fn satisfied(&self, state: &State) -> bool {
        self.post_condition
            .as_ref()
            .is_none_or(|condition| condition.check(state))
    }

    fn log_attempt(&self, state: &mut State, attempt: u32, outcome: AttemptOutcome) {
        state.log(
            &self.name,
            json!({
                "attempt": attempt,
                "outcome": outcome,
                "target": self.inner.name(),
            }),
        );
    }
}

impl Operation for SelfHeal {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: State) -> OpResult {
        let max_attempts = self.retries.saturating_add(1);
        let mut current = state;
        let mut attempts_made = 0;
        let mut last_error: Option<OpError> = None;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                if let Some(refine) = &self.on_weak {
                    match refine.run(current) {
                        Ok(refined) => current = refined,
                        Err(failure) => {
                            let (error, mut failed) = failure.into_parts();
                            if error.is_fatal() {
                                return Err(Failure::new(error, failed));
                            }
                            debug!(heal = %self.name, attempt, "refinement failed");
                            failed.log(
                                &self.name,
                                json!({
                                    "attempt": attempt,
                                    "outcome": AttemptOutcome::Failed,
                                    "target": refine.name(),
                                    "error": error.kind(),
                                    "message": error.to_string(),
                                }),
                            );
                            current = failed;
                            last_error = Some(error);
                            break;
                        }
                    }
                }
                let delay = self.backoff.delay(attempt - 1);
                if !delay.is_zero() {
                    debug!(heal = %self.name, attempt, delay_ms = delay.as_millis() as u64, "backing off");
                    thread::sleep(delay);
                }
            }

            attempts_made = attempt;
            let snapshot = current.clone();
            match self.inner.run(current) {
                Ok(mut out) => {
                    if self.satisfied(&out) {
                        self.log_attempt(&mut out, attempt, AttemptOutcome::Healed);
                        return Ok(out);
                    }
                    debug!(heal = %self.name, attempt, "weak result");
                    self.log_attempt(&mut out, attempt, AttemptOutcome::Weak);
                    current = out;
                    last_error = None;
                }
                Err(failure) => {
                    let (error, failed) = failure.into_parts();
                    if error.is_fatal() {
                        return Err(Failure::new(error, failed));
                    }
                    // Keep the data from before the attempt, but not at the cost of its trace.
                    let mut restored = snapshot;
                    restored.trace = failed.trace;
                    restored.log(
                        &self.name,
                        json!({
                            "attempt": attempt,
                            "outcome": AttemptOutcome::Failed,
                            "target": self.inner.name(),
                            "error": error.kind(),
                            "message": error.to_string(),
                        }),
                    );
                    current = restored;
                    let retryable = error.is_retryable();
                    last_error = Some(error);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let last_error = last_error.map(|error| error.to_string());
        match &self.fallback {
            Some(fallback) => {
                debug!(heal = %self.name, fallback = fallback.name(), "running fallback");
                let mut out = fallback.run(current)?;
                let satisfied = self.satisfied(&out);
                out.log(
                    &self.name,
                    json!({
                        "outcome": HealOutcome::FallbackUsed,
                        "target": fallback.name(),
                        "attempts": attempts_made,
                        "post_condition": satisfied,
                        "last_error": last_error,
                    }),
                );
                Ok(out)
            }
            None => {
                warn!(heal = %self.name, attempts = attempts_made, "unhealed");
                current.log(
                    &self.name,
                    json!({
                        "outcome": HealOutcome::Unhealed,
                        "target": self.inner.name(),
                        "attempts": attempts_made,
                        "last_error": last_error,
                    }),
                );
                Ok(current)
            }
        }
    }
}
