//! Candidate scoring, deduplication and evidence assembly.

use std::fs;

use serde_json::json;

use crate::core::error::OpResult;
use crate::core::op::{OnUnmet, Operation, unmet};
use crate::core::state::{Candidate, State, dedup_candidates};

const KEYWORD_BONUS: f64 = 0.3;

/// Boosts candidates whose snippet mentions a keyword, then keeps the best.
#[derive(Debug, Clone)]
pub struct Ranking {
    pub max_candidates: usize,
    pub keyword_boost: Vec<String>,
}

impl Default for Ranking {
    fn default() -> Self {
        Self {
            max_candidates: 20,
            keyword_boost: Vec::new(),
        }
    }
}

impl Ranking {
    pub fn new(max_candidates: usize, keyword_boost: Vec<String>) -> Self {
        Self {
            max_candidates,
            keyword_boost,
        }
    }

    fn score(&self, candidate: &Candidate) -> f64 {
        let snippet = candidate
            .snippet
            .as_deref()
            .map(str::to_lowercase)
            .unwrap_or_default();
        let hits = self
            .keyword_boost
            .iter()
            .filter(|kw| snippet.contains(&kw.to_lowercase()))
            .count();
        candidate.score + KEYWORD_BONUS * hits as f64
    }
}

impl Operation for Ranking {
    fn name(&self) -> &str {
        "Ranking"
    }

    fn run(&self, mut state: State) -> OpResult {
        let before = state.candidates.len();
        let mut ranked: Vec<Candidate> = state
            .candidates
            .iter()
            .map(|candidate| {
                let score = self.score(candidate);
                candidate.clone().with_score(score)
            })
            .collect();
        ranked.sort_by(|left, right| right.score.total_cmp(&left.score));
        ranked.truncate(self.max_candidates);
        state.candidates = ranked;
        state.log(
            self.name(),
            json!({ "before": before, "kept": state.candidates.len() }),
        );
        Ok(state)
    }
}

/// Drops repeated `(uri, snippet)` pairs, keeping the best-scored copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicate;

impl Operation for Deduplicate {
    fn name(&self) -> &str {
        "Deduplicate"
    }

    fn run(&self, mut state: State) -> OpResult {
        let before = state.candidates.len();
        state.candidates = dedup_candidates(&state.candidates);
        state.log(
            self.name(),
            json!({ "before": before, "kept": state.candidates.len() }),
        );
        Ok(state)
    }
}

fn read_file(candidate: &Candidate) -> Option<String> {
    let path = candidate.path()?;
    let bytes = fs::read(path).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn clip_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Replaces missing or oversized snippets with the head of the file.
#[derive(Debug, Clone)]
pub struct ContextEnricher {
    pub max_tokens: usize,
    pub on_unmet: OnUnmet,
}

impl Default for ContextEnricher {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            on_unmet: OnUnmet::Skip,
        }
    }
}

impl ContextEnricher {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }
}

impl Operation for ContextEnricher {
    fn name(&self) -> &str {
        "ContextEnricher"
    }

    fn run(&self, mut state: State) -> OpResult {
        if state.candidates.is_empty() {
            return unmet(state, self.name(), self.on_unmet, "candidates");
        }
        let mut enriched = 0usize;
        let candidates: Vec<Candidate> = state
            .candidates
            .iter()
            .map(|candidate| {
                let fits = candidate
                    .snippet
                    .as_deref()
                    .is_some_and(|snippet| snippet.chars().count() < self.max_tokens);
                if fits {
                    return candidate.clone();
                }
                match read_file(candidate).filter(|text| !text.is_empty()) {
                    Some(text) => {
                        enriched += 1;
                        candidate
                            .clone()
                            .with_snippet(clip_chars(&text, self.max_tokens * 4))
                    }
                    None => candidate.clone(),
                }
            })
            .collect();
        state.candidates = candidates;
        state.log(
            self.name(),
            json!({ "candidates": state.candidates.len(), "enriched": enriched }),
        );
        Ok(state)
    }
}

/// Joins candidate texts into `evidence`, each under a `----- <uri>` header.
///
/// Stops before the first chunk that would push the evidence past the window.
#[derive(Debug, Clone)]
pub struct Concat {
    pub max_window_chars: usize,
    pub on_unmet: OnUnmet,
}

impl Default for Concat {
    fn default() -> Self {
        Self {
            max_window_chars: 100_000,
            on_unmet: OnUnmet::Skip,
        }
    }
}

impl Concat {
    pub fn new(max_window_chars: usize) -> Self {
        Self {
            max_window_chars,
            ..Self::default()
        }
    }

    pub fn on_unmet(mut self, policy: OnUnmet) -> Self {
        self.on_unmet = policy;
        self
    }
}

impl Operation for Concat {
    fn name(&self) -> &str {
        "Concat"
    }

    fn run(&self, mut state: State) -> OpResult {
        if state.candidates.is_empty() {
            return unmet(state, self.name(), self.on_unmet, "candidates");
        }
        let mut text = String::new();
        let mut used = 0usize;
        let mut size = 0usize;
        for candidate in &state.candidates {
            let Some(chunk) = candidate.snippet.clone().or_else(|| read_file(candidate)) else {
                continue;
            };
            let chunk_chars = chunk.chars().count();
            if size + chunk_chars > self.max_window_chars {
                break;
            }
            let section = format!("\n\n----- {}\n{}", candidate.uri, chunk);
            size += section.chars().count();
            text.push_str(&section);
            used += 1;
        }

        state.log(self.name(), json!({ "chars": size, "used": used }));
        if !text.is_empty() {
            state.evidence = Some(match state.evidence.take() {
                Some(existing) => existing + &text,
                None => text,
            });
        }
        Ok(state)
    }
}
