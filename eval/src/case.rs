//! Case file parsing and validation.
//!
//! Cases are TOML files defining a query, pipeline overrides and checks.
//! See `eval/cases/` for examples.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

/// A parsed case file containing query, config, and checks.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CaseFile {
    pub case: CaseMeta,
    #[serde(default)]
    pub config: CaseConfig,
    #[serde(default)]
    pub checks: Vec<Check>,
}

/// Case metadata: identifier, query and ground truth.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CaseMeta {
    /// Unique identifier (slug format: `[a-z0-9_-]+`).
    pub id: String,
    /// Query passed to the pipeline.
    pub query: String,
    /// Files a perfect retrieval would return, relative to the searched dirs.
    /// Enables precision/recall scoring when non-empty.
    #[serde(default)]
    pub relevant_files: Vec<String>,
}

/// Pipeline configuration overrides for the case.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CaseConfig {
    /// Directories to search, relative to the repo root.
    #[serde(default)]
    pub dirs: Vec<PathBuf>,
    pub max_candidates: Option<usize>,
    pub retries: Option<u32>,
    pub budget_secs: Option<f64>,
}

/// Verification check run against the final pipeline state.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Check {
    /// The answer contains `text` (case-insensitive).
    AnswerContains { text: String },
    /// Some candidate points at a file whose path ends with `path`.
    FileHit { path: String },
    /// At least `count` candidates were returned.
    MinCandidates { count: usize },
}

impl CaseFile {
    /// Load and validate a case file from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read case {}", path.display()))?;
        let case: CaseFile =
            toml::from_str(&contents).with_context(|| format!("parse case {}", path.display()))?;
        case.validate()
            .with_context(|| format!("validate case {}", path.display()))?;
        Ok(case)
    }

    #[cfg(test)]
    pub fn parse_str(contents: &str) -> Result<Self> {
        let case: CaseFile = toml::from_str(contents).context("parse case")?;
        case.validate()?;
        Ok(case)
    }

    fn validate(&self) -> Result<()> {
        validate_case_id(&self.case.id)?;
        if self.case.query.trim().is_empty() {
            bail!("case.query must be non-empty");
        }
        if self.case.relevant_files.iter().any(|file| file.trim().is_empty()) {
            bail!("case.relevant_files entries must be non-empty");
        }
        if self.config.max_candidates == Some(0) {
            bail!("config.max_candidates must be > 0");
        }
        if let Some(budget) = self.config.budget_secs
            && !(budget.is_finite() && budget >= 0.0)
        {
            bail!("config.budget_secs must be a non-negative number");
        }
        if self.checks.is_empty() {
            bail!("checks must be a non-empty array");
        }
        for (index, check) in self.checks.iter().enumerate() {
            check
                .validate()
                .with_context(|| format!("checks[{}] invalid", index))?;
        }
        Ok(())
    }
}

impl Check {
    fn validate(&self) -> Result<()> {
        match self {
            Check::AnswerContains { text } => {
                if text.trim().is_empty() {
                    bail!("answer_contains.text must be non-empty");
                }
            }
            Check::FileHit { path } => {
                if path.trim().is_empty() {
                    bail!("file_hit.path must be non-empty");
                }
            }
            Check::MinCandidates { count } => {
                if *count == 0 {
                    bail!("min_candidates.count must be > 0");
                }
            }
        }
        Ok(())
    }
}

/// Discover and load all case files from a directory.
///
/// Returns cases sorted by id. Errors if duplicate ids are found.
pub fn discover_cases(dir: &Path) -> Result<Vec<CaseFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut cases = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read cases dir {}", dir.display()))? {
        let entry = entry.context("read case entry")?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("toml") {
            continue;
        }
        cases.push(CaseFile::load(&path)?);
    }
    cases.sort_by(|left, right| left.case.id.cmp(&right.case.id));
    for pair in cases.windows(2) {
        if pair[0].case.id == pair[1].case.id {
            return Err(anyhow!("duplicate case.id {}", pair[0].case.id));
        }
    }
    Ok(cases)
}

fn validate_case_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        bail!("case.id must be non-empty");
    }
    if id.contains('/') || id.contains('\\') {
        bail!("case.id must not contain path separators");
    }
    if id.contains("..") {
        bail!("case.id must not contain '..'");
    }
    if !id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        bail!("case.id must use [a-z0-9_-] only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_case() {
        let input = r#"
[case]
id = "lease-obligations"
query = "What are the lease obligations?"
relevant_files = ["notes/lease.md"]

[config]
dirs = ["eval/fixtures/finance"]
max_candidates = 5
retries = 1
budget_secs = 10.0

[[checks]]
type = "answer_contains"
text = "4.2m"

[[checks]]
type = "file_hit"
path = "notes/lease.md"

[[checks]]
type = "min_candidates"
count = 1
"#;
        let case = CaseFile::parse_str(input).expect("case parses");
        assert_eq!(case.case.id, "lease-obligations");
        assert_eq!(case.checks.len(), 3);
        assert_eq!(case.config.max_candidates, Some(5));
        assert_eq!(case.case.relevant_files, vec!["notes/lease.md"]);
    }

    #[test]
    fn rejects_invalid_id() {
        let input = r#"
[case]
id = "bad/id"
query = "q"

[[checks]]
type = "min_candidates"
count = 1
"#;
        let err = CaseFile::parse_str(input).expect_err("invalid id");
        assert!(err.to_string().contains("case.id"));
    }

    #[test]
    fn rejects_malformed_checks() {
        let input = r#"
[case]
id = "lease"
query = "q"

[[checks]]
type = "min_candidates"
count = 0
"#;
        let _err = CaseFile::parse_str(input).expect_err("invalid check");
    }

    #[test]
    fn discovers_sorted_cases_and_rejects_duplicates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let case = |id: &str| {
            format!("[case]\nid = \"{id}\"\nquery = \"q\"\n[[checks]]\ntype = \"min_candidates\"\ncount = 1\n")
        };
        fs::write(temp.path().join("b.toml"), case("beta")).expect("write");
        fs::write(temp.path().join("a.toml"), case("alpha")).expect("write");
        fs::write(temp.path().join("README.md"), "ignored").expect("write");

        let ids: Vec<String> = discover_cases(temp.path())
            .expect("discover")
            .into_iter()
            .map(|case| case.case.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "beta"]);

        fs::write(temp.path().join("c.toml"), case("alpha")).expect("write");
        assert!(discover_cases(temp.path()).is_err());
    }
}
