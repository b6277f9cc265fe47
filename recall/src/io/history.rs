//! Append-only JSONL record of finished runs.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::core::error::OpResult;
use crate::core::op::Operation;
use crate::core::state::{Budget, Query, State, TraceEvent};

#[derive(Debug, Serialize)]
struct CandidateRecord<'a> {
    uri: &'a str,
    line: Option<u64>,
    score: f64,
    provenance: &'a str,
    snippet: Option<String>,
}

/// One line of the history file.
#[derive(Debug, Serialize)]
struct HistoryRecord<'a> {
    ts: DateTime<Utc>,
    query: &'a Query,
    answer: Option<String>,
    evidence: Option<String>,
    candidates: Vec<CandidateRecord<'a>>,
    trace: &'a [TraceEvent],
    budget: &'a Budget,
}

/// Appends the current state to a JSONL file and passes it through.
///
/// Write failures are recorded in the trace; they never fail the run.
#[derive(Debug, Clone)]
pub struct PersistHistory {
    path: PathBuf,
    max_text: usize,
}

impl PersistHistory {
    pub fn new(path: impl Into<PathBuf>, max_text: usize) -> Self {
        Self {
            path: path.into(),
            max_text,
        }
    }

    fn clip(&self, text: Option<&str>) -> Option<String> {
        text.map(|text| text.chars().take(self.max_text).collect())
    }

    fn record<'a>(&self, state: &'a State) -> HistoryRecord<'a> {
        HistoryRecord {
            ts: Utc::now(),
            query: &state.query,
            answer: self.clip(state.answer.as_deref()),
            evidence: self.clip(state.evidence.as_deref()),
            candidates: state
                .candidates
                .iter()
                .map(|candidate| CandidateRecord {
                    uri: &candidate.uri,
                    line: candidate.line,
                    score: candidate.score,
                    provenance: &candidate.provenance,
                    snippet: self.clip(candidate.snippet.as_deref()),
                })
                .collect(),
            trace: state.trace.events(),
            budget: &state.budget,
        }
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("append {}", path.display()))?;
    Ok(())
}

impl Operation for PersistHistory {
    fn name(&self) -> &str {
        "PersistHistory"
    }

    fn run(&self, mut state: State) -> OpResult {
        let written = serde_json::to_string(&self.record(&state))
            .context("serialize history record")
            .and_then(|line| append_line(&self.path, &line));
        let path = self.path.display().to_string();
        match written {
            Ok(()) => {
                debug!(path = %path, "history appended");
                state.log(self.name(), json!({ "ok": true, "path": path }));
            }
            Err(err) => {
                warn!(path = %path, err = %format!("{err:#}"), "history write failed");
                state.log(
                    self.name(),
                    json!({ "ok": false, "path": path, "error": format!("{err:#}") }),
                );
            }
        }
        Ok(state)
    }
}

/// Read every record of a history file as JSON values.
pub fn read_history(path: &Path) -> Result<Vec<serde_json::Value>> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Candidate;

    #[test]
    fn appends_one_clipped_record_per_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/history.jsonl");
        let persist = PersistHistory::new(&path, 5);

        let mut state = State::new("lease");
        state.answer = Some("a long answer".to_string());
        state
            .candidates
            .push(Candidate::new("file:///a", "Grep").with_snippet("snippet text"));
        let state = persist.run(state).expect("run");
        persist.run(state.clone()).expect("run again");

        let records = read_history(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["answer"], "a lon");
        assert_eq!(records[0]["candidates"][0]["snippet"], "snipp");
        assert_eq!(records[0]["query"]["text"], "lease");
        assert_eq!(state.trace.last().map(|e| e.payload["ok"].clone()), Some(json!(true)));
    }

    #[test]
    fn write_failure_is_logged_not_raised() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, "not a dir").expect("write");
        let persist = PersistHistory::new(blocker.join("history.jsonl"), 100);
        let state = persist.run(State::new("q")).expect("never fails");
        let event = state.trace.last().expect("event");
        assert_eq!(event.payload["ok"], false);
        assert!(event.field("error").is_some());
    }
}
