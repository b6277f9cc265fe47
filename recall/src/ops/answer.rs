//! Answer composition from gathered evidence.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use serde_json::json;

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::Operation;
use crate::core::state::State;

/// Template used when the configuration does not provide one.
pub const DEFAULT_TEMPLATE: &str = include_str!("templates/answer.md");

/// Answer returned when no evidence was gathered.
pub const NO_EVIDENCE: &str = "No evidence found.";

const DEFAULT_MAX_EVIDENCE_CHARS: usize = 50_000;

#[derive(Debug, Serialize)]
struct SourceContext<'a> {
    uri: &'a str,
    line: Option<u64>,
    score: f64,
}

/// Renders a `minijinja` template over `query`, `evidence` and `candidates`.
#[derive(Debug, Clone)]
pub struct ComposeAnswer {
    template: String,
    max_evidence_chars: usize,
}

impl Default for ComposeAnswer {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            max_evidence_chars: DEFAULT_MAX_EVIDENCE_CHARS,
        }
    }
}

impl ComposeAnswer {
    /// Build from template source, rejecting templates that do not parse.
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        Environment::new()
            .template_from_str(&template)
            .context("parse answer template")?;
        Ok(Self {
            template,
            ..Self::default()
        })
    }

    pub fn max_evidence_chars(mut self, max: usize) -> Self {
        self.max_evidence_chars = max;
        self
    }

    fn render(&self, state: &State, evidence: &str) -> Result<String> {
        let sources: Vec<SourceContext<'_>> = state
            .candidates
            .iter()
            .map(|candidate| SourceContext {
                uri: &candidate.uri,
                line: candidate.line,
                score: candidate.score,
            })
            .collect();
        let env = Environment::new();
        let rendered = env.render_str(
            &self.template,
            context! {
                query => state.query.text.as_str(),
                lang => state.query.lang.as_str(),
                evidence => evidence,
                candidates => sources,
            },
        )?;
        Ok(rendered)
    }
}

impl Operation for ComposeAnswer {
    fn name(&self) -> &str {
        "ComposeAnswer"
    }

    fn run(&self, mut state: State) -> OpResult {
        let evidence: String = state
            .evidence
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .chars()
            .take(self.max_evidence_chars)
            .collect();

        if evidence.is_empty() {
            state.answer = Some(NO_EVIDENCE.to_string());
            state.log(self.name(), json!({ "chars": 0, "evidence": false }));
            return Ok(state);
        }

        match self.render(&state, &evidence) {
            Ok(answer) => {
                state.log(
                    self.name(),
                    json!({ "chars": answer.chars().count(), "evidence": true }),
                );
                state.answer = Some(answer);
                Ok(state)
            }
            Err(err) => {
                let error = OpError::logic(self.name(), format!("render answer: {err:#}"));
                Err(Failure::new(error, state))
            }
        }
    }
}
