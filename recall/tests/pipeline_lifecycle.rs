//! End-to-end runs of the default pipeline against a temporary file tree.
//!
//! Content search needs `rg` or `grep` on PATH; tests that depend on it
//! return early when neither is installed.

use recall::core::state::State;
use recall::io::config::RecallConfig;
use recall::io::history::read_history;
use recall::ops::{Engine, FollowMode};
use recall::pipeline::{RunStatus, ask, run_status};
use recall::test_support::FileTree;

fn config_for(tree: &FileTree) -> RecallConfig {
    let mut cfg = RecallConfig::default();
    cfg.search.dirs = vec![tree.path().to_path_buf()];
    cfg.budget.seconds = None;
    cfg
}

fn engine_available() -> bool {
    if Engine::detect().is_none() {
        eprintln!("skipping: neither rg nor grep on PATH");
        return false;
    }
    true
}

fn ops(state: &State) -> Vec<&str> {
    state.trace.iter().map(|event| event.op.as_str()).collect()
}

#[test]
fn answers_from_matching_file() {
    if !engine_available() {
        return;
    }
    let tree = FileTree::new().expect("tree");
    tree.write("notes/lease.md", "intro\nLease obligations total 4.2m\nend\n")
        .expect("write");
    tree.write("notes/revenue.md", "revenue grew by 12%\n")
        .expect("write");

    let state = ask(&config_for(&tree), "lease obligations")
        .expect("build")
        .expect("run");

    assert_eq!(run_status(&state), RunStatus::Answered);
    assert!(
        state
            .candidates
            .iter()
            .all(|candidate| candidate.uri.ends_with("lease.md"))
    );
    let answer = state.answer.as_deref().expect("answer");
    assert!(answer.contains("Lease obligations total 4.2m"));
    assert!(answer.contains("lease.md:2"));

    let order = ops(&state);
    let position = |op: &str| order.iter().position(|name| *name == op);
    assert!(position("SearchTermExtractor") < position("Grep"));
    assert!(position("Grep") < position("ComposeAnswer"));
    assert_eq!(order.last(), Some(&"WithBudget"));
}

#[test]
fn falls_back_to_globbing_when_nothing_matches() {
    if !engine_available() {
        return;
    }
    let tree = FileTree::new().expect("tree");
    tree.write("docs/guide.md", "nothing relevant here\n")
        .expect("write");

    let state = ask(&config_for(&tree), "zzqx-unfindable")
        .expect("build")
        .expect("run");

    assert!(!state.candidates.is_empty());
    assert!(
        state
            .candidates
            .iter()
            .all(|candidate| candidate.provenance == "Glob")
    );
    let heal = state
        .trace
        .by_op("HealSearch")
        .last()
        .expect("heal event");
    assert_eq!(heal.outcome(), Some("fallback-used"));
    assert_eq!(heal.payload["attempts"], 3);
    assert!(state.answer.is_some());
}

#[test]
fn unhealed_search_degrades_instead_of_failing() {
    if !engine_available() {
        return;
    }
    let tree = FileTree::new().expect("tree");
    tree.write("docs/guide.txt", "nothing relevant here\n")
        .expect("write");
    let mut cfg = config_for(&tree);
    cfg.heal.glob_fallback = false;
    cfg.heal.retries = 0;

    let state = ask(&cfg, "zzqx-unfindable").expect("build").expect("run");

    assert!(state.candidates.is_empty());
    assert_eq!(run_status(&state), RunStatus::Degraded);
}

#[test]
fn history_records_each_run() {
    if !engine_available() {
        return;
    }
    let tree = FileTree::new().expect("tree");
    tree.write("a.md", "quarterly revenue summary\n").expect("write");
    let history = tree.path().join("state/history.jsonl");
    let mut cfg = config_for(&tree);
    cfg.history.enabled = true;
    cfg.history.path = history.clone();
    cfg.search.ignore = r"history\.jsonl$".to_string();

    for query in ["quarterly revenue", "revenue summary"] {
        let state = ask(&cfg, query).expect("build").expect("run");
        let last = state.trace.last().expect("event");
        assert_eq!(last.op, "PersistHistory");
        assert_eq!(last.payload["ok"], true);
    }

    let records = read_history(&history).expect("read");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["query"]["text"], "quarterly revenue");
    assert_eq!(records[1]["query"]["text"], "revenue summary");
    assert!(records[1]["trace"].as_array().is_some_and(|trace| !trace.is_empty()));
}

#[test]
fn widened_recovery_counts_as_answered() {
    if !engine_available() {
        return;
    }
    let tree = FileTree::new().expect("tree");
    tree.write("docs/plan.txt", "project overview: lease renewals due in May\n")
        .expect("write");
    let mut cfg = config_for(&tree);
    cfg.heal.glob_fallback = false;
    cfg.heal.retries = 0;

    let state = ask(&cfg, "zzqx-unfindable").expect("build").expect("run");

    let heal: Vec<&str> = state
        .trace
        .by_op("HealSearch")
        .filter_map(|event| event.outcome())
        .collect();
    assert_eq!(heal, vec!["weak", "unhealed", "healed"]);
    assert!(
        state
            .trace
            .by_op("StagnationGuard")
            .any(|event| event.outcome() == Some("recovered"))
    );
    assert_eq!(state.candidates.len(), 1);
    assert_eq!(run_status(&state), RunStatus::Answered);
}

#[test]
fn repeated_matches_across_dirs_are_not_progress() {
    if !engine_available() {
        return;
    }
    let tree = FileTree::new().expect("tree");
    tree.write("a/lease.md", "lease terms for site a\n").expect("write");
    tree.write("b/lease.md", "lease terms for site b\n").expect("write");
    let mut cfg = config_for(&tree);
    cfg.search.dirs = vec![tree.path().join("a"), tree.path().join("b")];
    cfg.heal.glob_fallback = false;
    cfg.heal.retries = 1;
    cfg.looping.min_candidates = 3;

    let state = ask(&cfg, "lease terms").expect("build").expect("run");

    assert!(
        state
            .trace
            .by_op("HealSearch")
            .all(|event| event.outcome() != Some("healed"))
    );
    let mut uris: Vec<&str> = state
        .candidates
        .iter()
        .map(|candidate| candidate.uri.as_str())
        .collect();
    uris.sort_unstable();
    uris.dedup();
    assert_eq!(uris.len(), 2);
    assert_eq!(run_status(&state), RunStatus::Degraded);
}

#[test]
fn enabled_reference_following_pulls_in_referenced_files() {
    if !engine_available() {
        return;
    }
    let tree = FileTree::new().expect("tree");
    tree.write("report.md", "lease summary: see Note 14 for renewals\n")
        .expect("write");
    tree.write("notes/n14.md", "Note 14: renewal dates run to 2030\n")
        .expect("write");
    let mut cfg = config_for(&tree);
    cfg.refs.enabled = true;
    cfg.refs.mode = FollowMode::Light;

    let state = ask(&cfg, "lease summary").expect("build").expect("run");

    let followed = state
        .candidates
        .iter()
        .find(|candidate| candidate.uri.ends_with("notes/n14.md"))
        .expect("referenced file");
    assert_eq!(followed.provenance, "ReferenceFollower");
    let event = state
        .trace
        .by_op("ReferenceFollower")
        .last()
        .expect("follow event");
    assert_eq!(event.payload["added"], 1);
    assert_eq!(run_status(&state), RunStatus::Answered);

    cfg.refs.enabled = false;
    let state = ask(&cfg, "lease summary").expect("build").expect("run");
    assert_eq!(state.trace.by_op("ReferenceFollower").count(), 0);
}
