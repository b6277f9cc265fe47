//! Execution state threaded through every operation.
//!
//! A [`State`] is created once per pipeline run and handed from operation to
//! operation by value. Composites clone it only where they need independent
//! copies (branch arms, retry snapshots). Nothing here is global: a run owns
//! its state from the initial query to the returned answer.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the list of terms content search should look for.
pub const SEARCH_TERMS: &str = "search_terms";
/// Metadata key holding relative paths that narrow content search.
pub const PATH_HINTS: &str = "path_hints";
/// Metadata key recording which route a query router picked.
pub const ROUTE: &str = "route";

const DEFAULT_LANG: &str = "auto";

/// The user question plus metadata accumulated by query-mutating operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

fn default_lang() -> String {
    DEFAULT_LANG.to_string()
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            lang: default_lang(),
            meta: Map::new(),
        }
    }

    pub fn with_search_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_search_terms(terms.into_iter().map(Into::into).collect());
        self
    }

    /// Search terms from metadata; empty when none were set.
    pub fn search_terms(&self) -> Vec<String> {
        string_list(self.meta.get(SEARCH_TERMS))
    }

    pub fn set_search_terms(&mut self, terms: Vec<String>) {
        let values = terms.into_iter().map(Value::String).collect();
        self.meta.insert(SEARCH_TERMS.to_string(), Value::Array(values));
    }

    /// Path hints accept either plain strings or `{ "path": ... }` objects.
    pub fn path_hints(&self) -> Vec<String> {
        let Some(Value::Array(items)) = self.meta.get(PATH_HINTS) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(path) => Some(path.trim().to_string()),
                Value::Object(obj) => obj
                    .get("path")
                    .and_then(Value::as_str)
                    .map(|path| path.trim().to_string()),
                _ => None,
            })
            .filter(|path| !path.is_empty())
            .collect()
    }

    pub fn route(&self) -> Option<&str> {
        self.meta.get(ROUTE).and_then(Value::as_str)
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::new(text)
    }
}

/// One located match: where it is, what it says, how good it is, who found it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub score: f64,
    /// Name of the operation that produced the candidate.
    pub provenance: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl Candidate {
    pub fn new(uri: impl Into<String>, provenance: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            line: None,
            snippet: None,
            score: 0.0,
            provenance: provenance.into(),
            meta: Map::new(),
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_line(mut self, line: u64) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }

    /// Filesystem path for `file://` URIs.
    pub fn path(&self) -> Option<PathBuf> {
        self.uri.strip_prefix("file://").map(PathBuf::from)
    }
}

/// Enclosing composite context of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Branch(usize),
    Iteration(u32),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Branch(index) => write!(f, "branch={index}"),
            Scope::Iteration(index) => write!(f, "iteration={index}"),
        }
    }
}

/// Record of one step's identity and observable effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub op: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    /// Enclosing branch/iteration tags, innermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<Scope>,
}

impl TraceEvent {
    pub fn new(op: impl Into<String>, payload: Value) -> Self {
        Self {
            op: op.into(),
            timestamp: Utc::now(),
            payload,
            scope: Vec::new(),
        }
    }

    /// Payload field as a string, if present.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// `outcome` payload field, used by the resilience composites.
    pub fn outcome(&self) -> Option<&str> {
        self.field("outcome")
    }

    pub fn branch(&self) -> Option<usize> {
        self.scope.iter().find_map(|scope| match scope {
            Scope::Branch(index) => Some(*index),
            Scope::Iteration(_) => None,
        })
    }

    pub fn iteration(&self) -> Option<u32> {
        self.scope.iter().find_map(|scope| match scope {
            Scope::Iteration(index) => Some(*index),
            Scope::Branch(_) => None,
        })
    }

    fn within(mut self, scope: Scope) -> Self {
        self.scope.push(scope);
        self
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.format("%H:%M:%S%.3f"), self.op)?;
        for scope in &self.scope {
            write!(f, " [{scope}]")?;
        }
        write!(f, " {}", self.payload)
    }
}

/// Append-only audit log of operation invocations.
///
/// Events are never removed or reordered. Enclosing composites may add scope
/// tags to events appended under their watch; that is the only annotation an
/// event receives after it is pushed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trace(Vec<TraceEvent>);

impl Trace {
    pub fn push(&mut self, event: TraceEvent) {
        self.0.push(event);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TraceEvent> {
        self.0.iter()
    }

    pub fn last(&self) -> Option<&TraceEvent> {
        self.0.last()
    }

    /// Events recorded by the named operation, in order.
    pub fn by_op<'a>(&'a self, op: &'a str) -> impl Iterator<Item = &'a TraceEvent> + 'a {
        self.0.iter().filter(move |event| event.op == op)
    }

    /// Tag every event from `start` onwards with an enclosing scope.
    pub(crate) fn tag_since(&mut self, start: usize, scope: Scope) {
        for event in self.0.iter_mut().skip(start) {
            event.scope.push(scope);
        }
    }

    /// Append the events of `other` past `start`, tagged with `scope`.
    pub(crate) fn extend_scoped(&mut self, other: Trace, start: usize, scope: Scope) {
        self.0
            .extend(other.0.into_iter().skip(start).map(|event| event.within(scope)));
    }
}

impl<'a> IntoIterator for &'a Trace {
    type Item = &'a TraceEvent;
    type IntoIter = std::slice::Iter<'a, TraceEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Resource tracked by a budget wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Seconds,
    Tokens,
}

impl Resource {
    pub const ALL: [Resource; 2] = [Resource::Seconds, Resource::Tokens];

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Seconds => "seconds",
            Resource::Tokens => "tokens",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ceiling and consumption for one resource. A missing ceiling means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BudgetLine {
    pub ceiling: Option<f64>,
    pub spent: f64,
}

impl BudgetLine {
    pub fn is_exhausted(&self) -> bool {
        self.ceiling.is_some_and(|ceiling| self.spent >= ceiling)
    }

    pub fn remaining(&self) -> Option<f64> {
        self.ceiling.map(|ceiling| (ceiling - self.spent).max(0.0))
    }
}

/// Per-resource budget report. Empty unless a budget wrapper ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Budget(BTreeMap<Resource, BudgetLine>);

impl Budget {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, resource: Resource) -> Option<&BudgetLine> {
        self.0.get(&resource)
    }

    pub fn spent(&self, resource: Resource) -> f64 {
        self.0.get(&resource).map_or(0.0, |line| line.spent)
    }

    pub fn ceiling(&self, resource: Resource) -> Option<f64> {
        self.0.get(&resource).and_then(|line| line.ceiling)
    }

    /// Set the ceiling and raise `spent` to `spent` if that is larger.
    ///
    /// Spent amounts never decrease within a run.
    pub fn record(&mut self, resource: Resource, ceiling: Option<f64>, spent: f64) {
        let line = self.0.entry(resource).or_default();
        line.ceiling = ceiling;
        if spent > line.spent {
            line.spent = spent;
        }
    }

    /// Add a non-negative amount to `spent`.
    pub fn charge(&mut self, resource: Resource, amount: f64) {
        if amount > 0.0 {
            self.0.entry(resource).or_default().spent += amount;
        }
    }

    /// First exhausted resource, seconds before tokens.
    pub fn exhausted(&self) -> Option<Resource> {
        Resource::ALL
            .into_iter()
            .find(|resource| self.0.get(resource).is_some_and(BudgetLine::is_exhausted))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Resource, &BudgetLine)> {
        self.0.iter().map(|(resource, line)| (*resource, line))
    }
}

/// The single value flowing through a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub query: Query,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub trace: Trace,
    #[serde(default, skip_serializing_if = "Budget::is_empty")]
    pub budget: Budget,
}

impl State {
    pub fn new(query: impl Into<Query>) -> Self {
        Self {
            query: query.into(),
            candidates: Vec::new(),
            evidence: None,
            answer: None,
            trace: Trace::default(),
            budget: Budget::default(),
        }
    }

    /// Append one trace event.
    pub fn log(&mut self, op: &str, payload: Value) {
        self.trace.push(TraceEvent::new(op, payload));
    }

    pub fn evidence_chars(&self) -> usize {
        self.evidence.as_deref().map_or(0, |text| text.chars().count())
    }

    /// All text a downstream consumer would read: snippets, evidence, answer.
    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.candidates
            .iter()
            .filter_map(|candidate| candidate.snippet.as_deref())
            .chain(self.evidence.as_deref())
            .chain(self.answer.as_deref())
    }
}

/// Sort by score (descending) then uri and keep the first of each `(uri, snippet)`.
pub fn dedup_candidates(candidates: &[Candidate]) -> Vec<Candidate> {
    let mut sorted: Vec<&Candidate> = candidates.iter().collect();
    sorted.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.uri.cmp(&right.uri))
    });
    let mut seen = std::collections::HashSet::new();
    sorted
        .into_iter()
        .filter(|candidate| seen.insert((candidate.uri.clone(), candidate.snippet.clone())))
        .cloned()
        .collect()
}
