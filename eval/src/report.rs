use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::judge::Judgment;
use crate::metrics::Retrieval;
use crate::outcome::Outcome;
use crate::results::EvalMeta;

#[derive(Debug, Default)]
pub struct ReportSummary {
    pub runs: usize,
    pub success: usize,
    pub fail: usize,
    pub degraded: usize,
    pub error: usize,
    pub avg_duration_secs: Option<f64>,
    pub check_pass_rates: BTreeMap<String, (usize, usize)>,
    /// Mean over runs that carried ground truth.
    pub mean_retrieval: Option<Retrieval>,
}

pub fn load_run_dirs(case_results_dir: &Path) -> Result<Vec<PathBuf>> {
    if !case_results_dir.exists() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    for entry in fs::read_dir(case_results_dir)
        .with_context(|| format!("read {}", case_results_dir.display()))?
    {
        let entry = entry.context("read entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn aggregate(case_results_dir: &Path) -> Result<(ReportSummary, Vec<String>)> {
    let mut summary = ReportSummary::default();
    let mut warnings = Vec::new();
    let mut scored: Vec<Retrieval> = Vec::new();

    for run_dir in load_run_dirs(case_results_dir)? {
        let meta_path = run_dir.join("meta.json");
        let checks_path = run_dir.join("checks.json");

        let meta: EvalMeta = match fs::read_to_string(&meta_path)
            .with_context(|| format!("read {}", meta_path.display()))
            .and_then(|contents| serde_json::from_str(&contents).context("parse meta"))
        {
            Ok(meta) => meta,
            Err(err) => {
                warnings.push(format!(
                    "skip {}: meta.json invalid ({err})",
                    run_dir.display()
                ));
                continue;
            }
        };

        let judgment: Judgment = match fs::read_to_string(&checks_path)
            .with_context(|| format!("read {}", checks_path.display()))
            .and_then(|contents| serde_json::from_str(&contents).context("parse checks"))
        {
            Ok(checks) => checks,
            Err(err) => {
                warnings.push(format!(
                    "skip {}: checks.json invalid ({err})",
                    run_dir.display()
                ));
                continue;
            }
        };

        summary.runs += 1;
        match meta.outcome {
            Some(Outcome::Success) => summary.success += 1,
            Some(Outcome::Fail) => summary.fail += 1,
            Some(Outcome::Degraded) => summary.degraded += 1,
            Some(Outcome::Error) | None => summary.error += 1,
        }

        summary.avg_duration_secs = Some(match summary.avg_duration_secs {
            None => meta.duration_secs,
            Some(avg) => {
                let total = avg * (summary.runs as f64 - 1.0) + meta.duration_secs;
                total / summary.runs as f64
            }
        });

        if let Some(retrieval) = meta.retrieval {
            scored.push(retrieval);
        }
        update_check_pass_rates(&mut summary.check_pass_rates, &judgment);
    }

    summary.mean_retrieval = mean(&scored);
    Ok((summary, warnings))
}

fn mean(scored: &[Retrieval]) -> Option<Retrieval> {
    if scored.is_empty() {
        return None;
    }
    let count = scored.len() as f64;
    Some(Retrieval {
        precision: scored.iter().map(|r| r.precision).sum::<f64>() / count,
        recall: scored.iter().map(|r| r.recall).sum::<f64>() / count,
        f1: scored.iter().map(|r| r.f1).sum::<f64>() / count,
    })
}

fn update_check_pass_rates(stats: &mut BTreeMap<String, (usize, usize)>, judgment: &Judgment) {
    for check in &judgment.checks {
        let entry = stats.entry(check.label()).or_insert((0, 0));
        if check.passed() {
            entry.0 += 1;
        }
        entry.1 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::CheckOutcome;
    use tempfile::tempdir;

    fn write_meta(path: &Path, outcome: Outcome, duration: f64, retrieval: Option<Retrieval>) {
        let meta = EvalMeta {
            case_id: "case".to_string(),
            eval_run_id: "run".to_string(),
            case_hash: "hash".to_string(),
            git_sha: None,
            query: "q".to_string(),
            outcome: Some(outcome),
            start_time: "now".to_string(),
            end_time: "later".to_string(),
            duration_secs: duration,
            candidates: 1,
            trace_events: 3,
            pipeline_error: None,
            retrieval,
            errors: Vec::new(),
        };
        let contents = serde_json::to_string_pretty(&meta).expect("meta json");
        fs::write(path, format!("{contents}\n")).expect("write meta");
    }

    fn write_checks(path: &Path, passed: bool) {
        let judgment = Judgment {
            checks: vec![CheckOutcome::FileHit {
                path: "lease.md".to_string(),
                passed,
            }],
        };
        let contents = serde_json::to_string_pretty(&judgment).expect("checks json");
        fs::write(path, format!("{contents}\n")).expect("write checks");
    }

    #[test]
    fn aggregates_runs() {
        let temp = tempdir().expect("tempdir");
        let run1 = temp.path().join("run1");
        let run2 = temp.path().join("run2");
        let run3 = temp.path().join("run3");
        for dir in [&run1, &run2, &run3] {
            fs::create_dir_all(dir).expect("run dir");
        }

        let perfect = Retrieval {
            precision: 1.0,
            recall: 1.0,
            f1: 1.0,
        };
        write_meta(&run1.join("meta.json"), Outcome::Success, 5.0, Some(perfect));
        write_checks(&run1.join("checks.json"), true);

        let half = Retrieval {
            precision: 0.5,
            recall: 0.0,
            f1: 0.0,
        };
        write_meta(&run2.join("meta.json"), Outcome::Degraded, 15.0, Some(half));
        write_checks(&run2.join("checks.json"), false);

        write_meta(&run3.join("meta.json"), Outcome::Fail, 1.0, None);

        let (summary, warnings) = aggregate(temp.path()).expect("aggregate");
        assert_eq!(warnings.len(), 1);
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.degraded, 1);
        assert_eq!(summary.avg_duration_secs, Some(10.0));

        let key = "file_hit(lease.md)".to_string();
        assert_eq!(summary.check_pass_rates.get(&key), Some(&(1, 2)));

        let retrieval = summary.mean_retrieval.expect("mean");
        assert_eq!(retrieval.precision, 0.75);
        assert_eq!(retrieval.recall, 0.5);
    }
}
