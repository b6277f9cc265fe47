//! Case execution orchestration.
//!
//! Coordinates config merging, the in-process pipeline run, checks and
//! result capture.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use recall::io::config::RecallConfig;
use recall::pipeline::{ask, run_status};
use tracing::{debug, info, instrument};

use crate::case::CaseFile;
use crate::config::apply_case_config;
use crate::judge::{run_checks, write_judgment};
use crate::metrics::score;
use crate::outcome::{Outcome, classify_outcome};
use crate::results::{CaptureInput, capture_results, update_outcome};

/// Result of running a single case.
#[derive(Debug)]
pub struct RunOutcome {
    /// Unique identifier for this eval run.
    pub eval_run_id: String,
    /// Path to the results directory.
    pub results_dir: PathBuf,
    /// Classified outcome.
    pub outcome: Outcome,
}

pub fn eval_run_id(run_num: u32) -> String {
    format!("eval-{}-{run_num}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Run a case end-to-end: pipeline, checks, result capture.
#[instrument(skip_all, fields(case_id = %case.case.id))]
pub fn run_case(
    repo_root: &Path,
    case_path: &Path,
    case: &CaseFile,
    eval_run_id: &str,
) -> Result<RunOutcome> {
    info!("case run started");

    let cfg = apply_case_config(RecallConfig::default(), &case.config, repo_root)
        .context("apply case config")?;
    debug!(dirs = ?cfg.search.dirs, "config resolved");

    let started_at = Utc::now();
    let result = ask(&cfg, case.case.query.as_str()).context("build pipeline")?;
    let finished_at = Utc::now();

    let (state, status, error) = match result {
        Ok(state) => {
            let status = run_status(&state);
            (state, Some(status), None)
        }
        Err(failure) => {
            let (error, state) = failure.into_parts();
            (state, None, Some(error.to_string()))
        }
    };
    // A failed run is judged as if it returned nothing.
    let judged = status.map(|_| &state);
    info!(
        status = ?status,
        duration_secs = (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        "pipeline finished"
    );

    let retrieval = score(judged, &case.case.relevant_files);
    let capture_input = CaptureInput {
        case_id: &case.case.id,
        case_path,
        eval_run_id,
        query: &case.case.query,
        state: &state,
        error,
        retrieval,
        started_at,
        finished_at,
        repo_root,
    };
    let results_dir = capture_results(&repo_root.join("eval").join("results"), &capture_input)
        .context("capture results")?;

    debug!("running checks");
    let judgment = run_checks(&case.checks, judged);
    write_judgment(&results_dir.join("checks.json"), &judgment).context("write checks")?;

    let outcome = classify_outcome(status, &judgment);
    update_outcome(&results_dir, outcome).context("update outcome")?;

    info!(outcome = ?outcome, results_dir = %results_dir.display(), "case run complete");

    Ok(RunOutcome {
        eval_run_id: eval_run_id.to_string(),
        results_dir,
        outcome,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn eval_run_id_format() {
        let id = eval_run_id(2);
        assert!(id.starts_with("eval-"));
        assert!(id.ends_with("-2"));
    }

    #[test]
    fn zero_budget_case_is_captured_as_degraded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let case_path = temp.path().join("eval/cases/budget.toml");
        fs::create_dir_all(case_path.parent().expect("parent")).expect("cases dir");
        fs::write(
            &case_path,
            "[case]\nid = \"budget\"\nquery = \"lease\"\n[config]\nbudget_secs = 0.0\n[[checks]]\ntype = \"min_candidates\"\ncount = 1\n",
        )
        .expect("case");
        let case = CaseFile::load(&case_path).expect("load");

        let outcome = run_case(temp.path(), &case_path, &case, "eval-test-1").expect("run");
        assert_eq!(outcome.outcome, Outcome::Degraded);
        assert!(outcome.results_dir.join("meta.json").exists());
        assert!(outcome.results_dir.join("checks.json").exists());
        assert!(outcome.results_dir.join("state.json").exists());
    }
}
