//! Wall-clock and token ceilings across a sequence of operations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::{Operation, SharedOp};
use crate::core::state::{Resource, State};

/// Monotonic time source. Only differences between readings are used.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Deterministic token count estimate for a piece of text.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> u64;

    /// Estimate over every readable text part of `state`.
    fn estimate_state(&self, state: &State) -> u64 {
        state
            .text_parts()
            .map(|text| self.estimate(text))
            .fold(0, u64::saturating_add)
    }
}

/// `ceil(chars / chars_per_token)`.
#[derive(Debug, Clone, Copy)]
pub struct CharsPerToken(pub usize);

impl Default for CharsPerToken {
    fn default() -> Self {
        Self(4)
    }
}

impl TokenEstimator for CharsPerToken {
    fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count();
        u64::try_from(chars.div_ceil(self.0.max(1))).unwrap_or(u64::MAX)
    }
}

/// Runs `ops` in order while both ceilings hold.
///
/// Checks happen only between operations, so the last operation to start may
/// overshoot a ceiling; everything after it is skipped. Exhaustion is not an
/// error: the state comes back with `budget` stamped and a `budget-exhausted`
/// event.
pub struct WithBudget {
    name: String,
    ops: Vec<SharedOp>,
    seconds: Option<f64>,
    tokens: Option<f64>,
    clock: Arc<dyn Clock>,
    estimator: Arc<dyn TokenEstimator>,
}

impl WithBudget {
    pub fn new(ops: Vec<SharedOp>) -> Self {
        Self {
            name: "WithBudget".to_string(),
            ops,
            seconds: None,
            tokens: None,
            clock: Arc::new(SystemClock::default()),
            estimator: Arc::new(CharsPerToken::default()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn seconds(mut self, ceiling: Option<f64>) -> Self {
        self.seconds = ceiling;
        self
    }

    pub fn tokens(mut self, ceiling: Option<f64>) -> Self {
        self.tokens = ceiling;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    fn stamp_seconds(&self, state: &mut State, carried: f64, started: Duration) {
        let elapsed = self.clock.now().saturating_sub(started).as_secs_f64();
        state
            .budget
            .record(Resource::Seconds, self.seconds, carried + elapsed);
    }

    fn exhausted(&self, mut state: State, resource: Resource, index: usize) -> State {
        let skipped: Vec<&str> = self.ops[index..].iter().map(|op| op.name()).collect();
        warn!(budget = %self.name, %resource, skipped = skipped.len(), "budget exhausted");
        let line = state.budget.get(resource).copied().unwrap_or_default();
        state.log(
            &self.name,
            json!({
                "outcome": "budget-exhausted",
                "resource": resource,
                "spent": line.spent,
                "ceiling": line.ceiling,
                "skipped": skipped,
            }),
        );
        state
    }
}

impl Operation for WithBudget {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, state: State) -> OpResult {
        let mut state = state;
        let carried = state.budget.spent(Resource::Seconds);
        let started = self.clock.now();
        let tokens_spent = state.budget.spent(Resource::Tokens);
        state
            .budget
            .record(Resource::Tokens, self.tokens, tokens_spent);

        for (index, op) in self.ops.iter().enumerate() {
            self.stamp_seconds(&mut state, carried, started);
            if let Some(resource) = state.budget.exhausted() {
                return Ok(self.exhausted(state, resource, index));
            }

            debug!(budget = %self.name, index, op = op.name(), "budgeted step");
            let before_spent = state.budget.spent(Resource::Tokens);
            let before_estimate = self.estimator.estimate_state(&state);
            match op.run(state) {
                Ok(out) => {
                    state = out;
                    let growth = self
                        .estimator
                        .estimate_state(&state)
                        .saturating_sub(before_estimate);
                    // Nested budgets may already have charged part of this growth.
                    state.budget.record(
                        Resource::Tokens,
                        self.tokens,
                        before_spent + growth as f64,
                    );
                }
                Err(failure) => {
                    let (error, mut out) = failure.into_parts();
                    self.stamp_seconds(&mut out, carried, started);
                    if let OpError::ResourceExhausted { resource, .. } = error {
                        return Ok(self.exhausted(out, resource, index + 1));
                    }
                    return Err(Failure::new(error, out));
                }
            }
        }

        self.stamp_seconds(&mut state, carried, started);
        state.log(
            &self.name,
            json!({
                "outcome": "within-budget",
                "seconds": state.budget.spent(Resource::Seconds),
                "tokens": state.budget.spent(Resource::Tokens),
            }),
        );
        Ok(state)
    }
}
