//! Recall configuration stored under `.recall/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::heal::Backoff;
use crate::ops::answer::ComposeAnswer;
use crate::ops::refs::FollowMode;
use crate::ops::search::DEFAULT_IGNORE;
use crate::ops::terms::DEFAULT_WIDEN_TERMS;

pub const CONFIG_DIR: &str = ".recall";
pub const CONFIG_FILE: &str = "config.toml";

/// Default location of the config file under `root`.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Recall configuration (TOML).
///
/// Meant to be edited by hand. Every section is optional and missing fields
/// fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecallConfig {
    pub search: SearchConfig,
    pub rank: RankConfig,
    pub heal: HealConfig,
    #[serde(rename = "loop")]
    pub looping: LoopConfig,
    pub refs: RefsConfig,
    pub budget: BudgetConfig,
    pub context: ContextConfig,
    pub answer: AnswerConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SearchConfig {
    /// Directories searched for content; each gets its own parallel arm.
    pub dirs: Vec<PathBuf>,
    /// Restrict content search to files matching this glob.
    pub file_glob: Option<String>,
    /// Regex over paths whose matches are discarded.
    pub ignore: String,
    pub context_lines: usize,
    pub case_insensitive: bool,
    pub timeout_secs: u64,
    /// Keep at most this many bytes of engine output per search.
    pub output_limit_bytes: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dirs: vec![PathBuf::from(".")],
            file_glob: None,
            ignore: DEFAULT_IGNORE.to_string(),
            context_lines: 2,
            case_insensitive: true,
            timeout_secs: 10,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RankConfig {
    pub max_candidates: usize,
    pub keyword_boost: Vec<String>,
}

impl Default for RankConfig {
    fn default() -> Self {
        Self {
            max_candidates: 20,
            keyword_boost: Vec::new(),
        }
    }
}

/// Delay policy between search retries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Exponential {
        base_ms: u64,
        cap_ms: u64,
    },
}

impl BackoffConfig {
    pub fn to_backoff(self) -> Backoff {
        match self {
            BackoffConfig::None => Backoff::None,
            BackoffConfig::Fixed { delay_ms } => Backoff::Fixed(Duration::from_millis(delay_ms)),
            BackoffConfig::Exponential { base_ms, cap_ms } => Backoff::Exponential {
                base: Duration::from_millis(base_ms),
                cap: Duration::from_millis(cap_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealConfig {
    pub retries: u32,
    /// Terms added to the search before a retry.
    pub widen_terms: Vec<String>,
    /// Fall back to path discovery when content search stays empty.
    pub glob_fallback: bool,
    pub glob_pattern: String,
    pub backoff: BackoffConfig,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            widen_terms: DEFAULT_WIDEN_TERMS.iter().map(|t| t.to_string()).collect(),
            glob_fallback: true,
            glob_pattern: "**/*.md".to_string(),
            backoff: BackoffConfig::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    pub max_iterations: u32,
    /// Stop iterating once this many candidates were found.
    pub min_candidates: usize,
    /// Smallest per-iteration gain that counts as progress.
    pub min_gain: i64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            min_candidates: 1,
            min_gain: 1,
        }
    }
}

/// Following cross-references ("see Note 12") out of the first matches.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefsConfig {
    pub enabled: bool,
    pub mode: FollowMode,
    /// Overrides the mode's hop limit.
    pub max_hops: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Wall-clock ceiling in seconds; absent means unlimited.
    pub seconds: Option<f64>,
    /// Estimated token ceiling; absent means unlimited.
    pub tokens: Option<f64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            seconds: Some(30.0),
            tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub max_window_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            max_window_chars: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnswerConfig {
    /// Inline `minijinja` template; the built-in one is used when absent.
    pub template: Option<String>,
    pub max_evidence_chars: usize,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            template: None,
            max_evidence_chars: 50_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// Clip stored snippets, evidence and answers to this many characters.
    pub max_text: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from(CONFIG_DIR).join("history.jsonl"),
            max_text: 20_000,
        }
    }
}

fn check_ceiling(name: &str, ceiling: Option<f64>) -> Result<()> {
    match ceiling {
        Some(value) if !value.is_finite() || value < 0.0 => {
            Err(anyhow!("{name} must be a non-negative number"))
        }
        _ => Ok(()),
    }
}

impl RecallConfig {
    pub fn validate(&self) -> Result<()> {
        if self.search.dirs.is_empty() {
            return Err(anyhow!("search.dirs must list at least one directory"));
        }
        if self.search.timeout_secs == 0 {
            return Err(anyhow!("search.timeout_secs must be > 0"));
        }
        if self.search.output_limit_bytes == 0 {
            return Err(anyhow!("search.output_limit_bytes must be > 0"));
        }
        Regex::new(&self.search.ignore).context("search.ignore must be a valid regex")?;
        if self.rank.max_candidates == 0 {
            return Err(anyhow!("rank.max_candidates must be > 0"));
        }
        if let BackoffConfig::Exponential { base_ms, cap_ms } = self.heal.backoff
            && base_ms > cap_ms
        {
            return Err(anyhow!("heal.backoff.base_ms must be <= cap_ms"));
        }
        if self.heal.glob_fallback && self.heal.glob_pattern.trim().is_empty() {
            return Err(anyhow!("heal.glob_pattern must be set when glob_fallback is on"));
        }
        if self.looping.max_iterations == 0 {
            return Err(anyhow!("loop.max_iterations must be > 0"));
        }
        check_ceiling("budget.seconds", self.budget.seconds)?;
        check_ceiling("budget.tokens", self.budget.tokens)?;
        if self.context.max_tokens == 0 {
            return Err(anyhow!("context.max_tokens must be > 0"));
        }
        if self.context.max_window_chars == 0 {
            return Err(anyhow!("context.max_window_chars must be > 0"));
        }
        if let Some(template) = &self.answer.template {
            ComposeAnswer::new(template.as_str()).context("answer.template")?;
        }
        if self.history.max_text == 0 {
            return Err(anyhow!("history.max_text must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RecallConfig::default()`.
pub fn load_config(path: &Path) -> Result<RecallConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config missing, using defaults");
        let cfg = RecallConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RecallConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RecallConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RecallConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        let mut cfg = RecallConfig::default();
        cfg.heal.backoff = BackoffConfig::Exponential {
            base_ms: 50,
            cap_ms: 400,
        };
        cfg.budget.tokens = Some(5000.0);
        cfg.refs = RefsConfig {
            enabled: true,
            mode: FollowMode::Aggressive,
            max_hops: Some(3),
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[search]\ndirs = [\"docs\", \"notes\"]\n\n[loop]\nmax_iterations = 5\n\n[heal.backoff]\nkind = \"fixed\"\ndelay_ms = 10\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.search.dirs.len(), 2);
        assert_eq!(cfg.looping.max_iterations, 5);
        assert_eq!(cfg.heal.retries, 2);
        assert_eq!(cfg.refs, RefsConfig::default());
        assert_eq!(
            cfg.heal.backoff.to_backoff(),
            Backoff::Fixed(Duration::from_millis(10))
        );
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut cfg = RecallConfig::default();
        cfg.looping.max_iterations = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RecallConfig::default();
        cfg.budget.seconds = Some(-1.0);
        assert!(cfg.validate().is_err());

        let mut cfg = RecallConfig::default();
        cfg.search.ignore = "(".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RecallConfig::default();
        cfg.answer.template = Some("{% if %}".to_string());
        assert!(cfg.validate().is_err());
    }
}
