//! Result capture and persistence.
//!
//! Writes the final pipeline state and run metadata to the results directory
//! for later analysis.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use recall::core::state::State;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::metrics::Retrieval;
use crate::outcome::Outcome;

/// Input for capturing results from a completed run.
#[derive(Debug)]
pub struct CaptureInput<'a> {
    pub case_id: &'a str,
    pub case_path: &'a Path,
    pub eval_run_id: &'a str,
    pub query: &'a str,
    /// Final state; for a failed run, the state at the point of failure.
    pub state: &'a State,
    /// Error message when the pipeline failed.
    pub error: Option<String>,
    pub retrieval: Option<Retrieval>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub repo_root: &'a Path,
}

/// Metadata for an eval run, persisted to `meta.json`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EvalMeta {
    pub case_id: String,
    pub eval_run_id: String,
    /// SHA-256 hash of the case file for reproducibility tracking.
    pub case_hash: String,
    /// Git SHA of the repo at time of run.
    pub git_sha: Option<String>,
    pub query: String,
    pub outcome: Option<Outcome>,
    pub start_time: String,
    pub end_time: String,
    pub duration_secs: f64,
    pub candidates: usize,
    pub trace_events: usize,
    #[serde(default)]
    pub pipeline_error: Option<String>,
    #[serde(default)]
    pub retrieval: Option<Retrieval>,
    /// Non-fatal errors encountered during capture.
    pub errors: Vec<String>,
}

/// Capture results from a completed run to the results directory.
///
/// Writes `state.json` and `meta.json`.
#[instrument(skip_all, fields(case_id = %input.case_id, eval_run_id = %input.eval_run_id))]
pub fn capture_results(base_dir: &Path, input: &CaptureInput<'_>) -> Result<PathBuf> {
    let results_dir = results_dir(base_dir, input.case_id, input.eval_run_id);
    fs::create_dir_all(&results_dir)
        .with_context(|| format!("create results dir {}", results_dir.display()))?;

    let mut errors = Vec::new();

    let case_hash = match file_sha256(input.case_path) {
        Ok(hash) => hash,
        Err(err) => {
            errors.push(format!("case hash: {err}"));
            String::new()
        }
    };

    let git_sha = match git_rev_parse(input.repo_root) {
        Ok(sha) => Some(sha),
        Err(err) => {
            errors.push(format!("git sha: {err}"));
            None
        }
    };

    if let Err(err) = write_json(&results_dir.join("state.json"), input.state) {
        errors.push(format!("state.json: {err:#}"));
    }

    if !errors.is_empty() {
        warn!(errors = ?errors, "artifact capture had errors");
    }

    let duration = input.finished_at - input.started_at;
    let meta = EvalMeta {
        case_id: input.case_id.to_string(),
        eval_run_id: input.eval_run_id.to_string(),
        case_hash,
        git_sha,
        query: input.query.to_string(),
        outcome: None,
        start_time: input.started_at.to_rfc3339(),
        end_time: input.finished_at.to_rfc3339(),
        duration_secs: duration.num_milliseconds() as f64 / 1000.0,
        candidates: input.state.candidates.len(),
        trace_events: input.state.trace.len(),
        pipeline_error: input.error.clone(),
        retrieval: input.retrieval,
        errors,
    };

    write_json(&results_dir.join("meta.json"), &meta)?;
    debug!(results_dir = %results_dir.display(), "results captured");
    Ok(results_dir)
}

pub fn update_outcome(results_dir: &Path, outcome: Outcome) -> Result<()> {
    let meta_path = results_dir.join("meta.json");
    let mut meta: EvalMeta = serde_json::from_str(
        &fs::read_to_string(&meta_path).with_context(|| format!("read {}", meta_path.display()))?,
    )
    .context("parse meta")?;
    meta.outcome = Some(outcome);
    write_json(&meta_path, &meta)?;
    Ok(())
}

pub fn results_dir(base_dir: &Path, case_id: &str, eval_run_id: &str) -> PathBuf {
    base_dir.join(case_id).join(eval_run_id)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value).context("serialize json")?;
    fs::write(path, format!("{contents}\n"))
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn file_sha256(path: &Path) -> Result<String> {
    let contents = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(contents);
    let digest = hasher.finalize();
    Ok(hex::encode(digest))
}

fn git_rev_parse(repo_root: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo_root)
        .output()
        .context("git rev-parse")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("git rev-parse failed: {}", stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use recall::core::state::Candidate;
    use tempfile::tempdir;

    #[test]
    fn results_dir_is_stable() {
        let base = Path::new("/tmp/results");
        let dir = results_dir(base, "case", "run-1");
        assert_eq!(dir, PathBuf::from("/tmp/results/case/run-1"));
    }

    #[test]
    fn writes_state_and_meta() {
        let temp = tempdir().expect("tempdir");
        let case_path = temp.path().join("case.toml");
        fs::write(&case_path, "[case]\nid='case'\nquery='q'\n").expect("case");

        let mut state = State::new("q");
        state.candidates.push(Candidate::new("file:///a.md", "Grep"));
        state.log("Grep", serde_json::json!({ "matches": 1 }));

        let input = CaptureInput {
            case_id: "case",
            case_path: &case_path,
            eval_run_id: "eval-1",
            query: "q",
            state: &state,
            error: None,
            retrieval: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            repo_root: temp.path(),
        };
        let output_dir = capture_results(&temp.path().join("results"), &input).expect("capture");
        assert!(output_dir.join("state.json").exists());

        update_outcome(&output_dir, Outcome::Success).expect("update");
        let meta: EvalMeta = serde_json::from_str(
            &fs::read_to_string(output_dir.join("meta.json")).expect("read"),
        )
        .expect("parse");
        assert_eq!(meta.outcome, Some(Outcome::Success));
        assert_eq!(meta.candidates, 1);
        assert_eq!(meta.trace_events, 1);
        assert_eq!(meta.case_hash.len(), 64);
    }
}
