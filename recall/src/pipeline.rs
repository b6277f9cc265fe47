//! Default search pipeline assembled from configuration.
//!
//! ```text
//! recall
//! ├── WithBudget
//! │   ├── LanguageNormalizer
//! │   ├── SearchTermExtractor
//! │   ├── Loop (until enough candidates)
//! │   │   └── StagnationGuard (on stall: widen terms)
//! │   │       └── SelfHeal (on weak: widen terms, fallback: glob + rank)
//! │   │           └── Search
//! │   │               ├── Grep, or Branch of one Grep per directory
//! │   │               └── Deduplicate
//! │   ├── ReferenceFollower (when enabled)
//! │   ├── Deduplicate
//! │   ├── Ranking
//! │   ├── ContextEnricher
//! │   ├── Concat
//! │   └── ComposeAnswer
//! └── PersistHistory (when enabled)
//! ```

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::branch::Branch;
use crate::core::budget::WithBudget;
use crate::core::error::OpResult;
use crate::core::heal::SelfHeal;
use crate::core::looping::Loop;
use crate::core::op::{HasCandidates, SharedOp, run_pipeline};
use crate::core::stack::Stack;
use crate::core::stagnation::StagnationGuard;
use crate::core::state::{Query, State};
use crate::io::config::RecallConfig;
use crate::io::history::PersistHistory;
use crate::ops::{
    ComposeAnswer, Concat, ContextEnricher, Deduplicate, Glob, Grep, LanguageNormalizer, Ranking,
    ReferenceFollower, SearchTermExtractor, WidenSearchTerms,
};

fn grep_for(cfg: &RecallConfig, dir: &Path) -> Result<Grep> {
    Ok(Grep::new(dir)
        .file_glob(cfg.search.file_glob.clone())
        .ignore(&cfg.search.ignore)?
        .context_lines(cfg.search.context_lines)
        .case_insensitive(cfg.search.case_insensitive)
        .timeout(cfg.search.timeout())
        .output_limit_bytes(cfg.search.output_limit_bytes))
}

/// Content search over every configured directory, deduplicated so that
/// re-finding a known match never counts as progress.
fn search_op(cfg: &RecallConfig) -> Result<SharedOp> {
    let mut arms: Vec<SharedOp> = Vec::with_capacity(cfg.search.dirs.len());
    for dir in &cfg.search.dirs {
        arms.push(Arc::new(grep_for(cfg, dir)?));
    }
    let search: SharedOp = if arms.len() == 1 {
        arms.pop().context("search.dirs is empty")?
    } else {
        Arc::new(Branch::new(arms).named("SearchDirs"))
    };
    Ok(Arc::new(Stack::named("Search", vec![search, Arc::new(Deduplicate)])))
}

fn glob_fallback(cfg: &RecallConfig) -> SharedOp {
    let mut ops: Vec<SharedOp> = cfg
        .search
        .dirs
        .iter()
        .map(|dir| Arc::new(Glob::new(dir, cfg.heal.glob_pattern.clone())) as SharedOp)
        .collect();
    ops.push(Arc::new(Ranking::new(
        cfg.rank.max_candidates,
        cfg.rank.keyword_boost.clone(),
    )));
    Arc::new(Stack::named("GlobFallback", ops))
}

/// Follows references under the only search directory, or under the
/// directory shared by the matches when several are configured.
fn follow_refs(cfg: &RecallConfig) -> Result<SharedOp> {
    let root = match cfg.search.dirs.as_slice() {
        [dir] => Some(dir.clone()),
        _ => None,
    };
    let search = grep_for(cfg, root.as_deref().unwrap_or(Path::new(".")))?;
    let mut follower = ReferenceFollower::new(cfg.refs.mode)?
        .root(root)
        .search(search);
    if let Some(hops) = cfg.refs.max_hops {
        follower = follower.max_hops(hops);
    }
    Ok(Arc::new(follower))
}

/// Build the default pipeline. Fails only on invalid configuration.
pub fn build_pipeline(cfg: &RecallConfig) -> Result<SharedOp> {
    cfg.validate()?;
    let enough = Arc::new(HasCandidates {
        min: cfg.looping.min_candidates,
    });
    let widen: SharedOp = Arc::new(WidenSearchTerms::new(cfg.heal.widen_terms.clone()));

    let mut heal = SelfHeal::new(search_op(cfg)?)
        .named("HealSearch")
        .retries(cfg.heal.retries)
        .backoff(cfg.heal.backoff.to_backoff())
        .post_condition(enough.clone())
        .on_weak(widen.clone());
    if cfg.heal.glob_fallback {
        heal = heal.fallback(glob_fallback(cfg));
    }

    let guard = StagnationGuard::new(Arc::new(heal), widen).min_gain(cfg.looping.min_gain);
    let search_loop = Loop::new(Arc::new(guard), cfg.looping.max_iterations)
        .named("SearchLoop")
        .until(enough);

    let answer = match &cfg.answer.template {
        Some(template) => ComposeAnswer::new(template.as_str())?,
        None => ComposeAnswer::default(),
    }
    .max_evidence_chars(cfg.answer.max_evidence_chars);

    let mut steps: Vec<SharedOp> = vec![
        Arc::new(LanguageNormalizer),
        Arc::new(SearchTermExtractor::default()),
        Arc::new(search_loop),
    ];
    if cfg.refs.enabled {
        steps.push(follow_refs(cfg)?);
    }
    let tail: [SharedOp; 5] = [
        Arc::new(Deduplicate),
        Arc::new(Ranking::new(
            cfg.rank.max_candidates,
            cfg.rank.keyword_boost.clone(),
        )),
        Arc::new(ContextEnricher::new(cfg.context.max_tokens)),
        Arc::new(Concat::new(cfg.context.max_window_chars)),
        Arc::new(answer),
    ];
    steps.extend(tail);
    let budgeted = WithBudget::new(steps)
        .seconds(cfg.budget.seconds)
        .tokens(cfg.budget.tokens);

    let mut ops: Vec<SharedOp> = vec![Arc::new(budgeted)];
    if cfg.history.enabled {
        ops.push(Arc::new(PersistHistory::new(
            cfg.history.path.clone(),
            cfg.history.max_text,
        )));
    }
    Ok(Arc::new(Stack::named("recall", ops)))
}

/// Build the default pipeline and run it once.
pub fn ask(cfg: &RecallConfig, query: impl Into<Query>) -> Result<OpResult> {
    let pipeline = build_pipeline(cfg)?;
    Ok(run_pipeline(pipeline.as_ref(), query))
}

/// How a finished (non-failed) run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Every step ran to completion.
    Answered,
    /// A budget ran out, the search stalled, or recovery gave up.
    Degraded,
}

/// Classify a returned state from its trace.
///
/// Budget exhaustion and entry-point degradation always count. An `unhealed`
/// recovery counts only until the same operation later heals or an enclosing
/// guard reports `recovered`. A stall counts only if the last loop stopped on it.
pub fn run_status(state: &State) -> RunStatus {
    let mut unhealed: Vec<&str> = Vec::new();
    let mut stalled = false;
    for event in state.trace.iter() {
        match event.outcome() {
            Some("budget-exhausted" | "degraded") => return RunStatus::Degraded,
            Some("unhealed") => {
                if !unhealed.contains(&event.op.as_str()) {
                    unhealed.push(&event.op);
                }
            }
            Some("healed" | "fallback-used") => unhealed.retain(|op| *op != event.op),
            Some("recovered") => unhealed.clear(),
            _ => {}
        }
        if let Some(stop) = event.field("stop") {
            stalled = stop == "stalled";
        }
    }
    if stalled || !unhealed.is_empty() {
        RunStatus::Degraded
    } else {
        RunStatus::Answered
    }
}
