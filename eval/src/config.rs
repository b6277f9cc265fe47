//! Pipeline configuration merging.
//!
//! Applies case-specific overrides to the default recall configuration.

use std::path::Path;

use anyhow::Result;
use recall::io::config::RecallConfig;

use crate::case::CaseConfig;

/// Apply case configuration overrides to the base config.
///
/// Relative search dirs are resolved against `repo_root`.
pub fn apply_case_config(
    mut base: RecallConfig,
    overrides: &CaseConfig,
    repo_root: &Path,
) -> Result<RecallConfig> {
    if !overrides.dirs.is_empty() {
        base.search.dirs = overrides.dirs.clone();
    }
    base.search.dirs = base
        .search
        .dirs
        .iter()
        .map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                repo_root.join(dir)
            }
        })
        .collect();
    if let Some(max_candidates) = overrides.max_candidates {
        base.rank.max_candidates = max_candidates;
    }
    if let Some(retries) = overrides.retries {
        base.heal.retries = retries;
    }
    if let Some(seconds) = overrides.budget_secs {
        base.budget.seconds = Some(seconds);
    }
    base.validate()?;
    Ok(base)
}
