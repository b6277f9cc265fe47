//! Cross-reference following ("see Note 12", "Section 2.3", "Appendix C").

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::Operation;
use crate::core::state::{Candidate, Query, State, dedup_candidates};
use crate::ops::search::Grep;

/// Reference shapes found in long documents. Matched case-insensitively;
/// the whole match becomes the search target.
pub const DEFAULT_REF_PATTERNS: &[&str] = &[
    r"See\s+Note\s+\d+[A-Za-z]?",
    r"Note\s+\d+[A-Za-z]?",
    r"Item\s+\d+[A-Za-z]?",
    r"(?:Section|Sec\.|§)\s+\d+(?:\.\d+)*",
    r"Appendix\s+[A-Z]\b",
    r"Exhibit\s+\d+(?:\.\d+)*",
    r"Table\s+\d+(?:\.\d+)*",
    r"Figure\s+\d+(?:\.\d+)*",
    r"Schedule\s+[A-Z0-9.]+",
    r"\[\s*\d+[A-Za-z]?\s*\]",
    r"#[A-Za-z][\w-]{2,}",
];

const PATHISH: &str = r"(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_.-]+|[A-Za-z0-9_.-]+\.(?:py|js|ts|md|txt|rst|ini|ya?ml|json)";

/// How far and how wide to follow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowMode {
    Light,
    #[default]
    Balanced,
    Aggressive,
}

impl FollowMode {
    fn max_targets(self) -> usize {
        match self {
            FollowMode::Light => 32,
            FollowMode::Balanced => 64,
            FollowMode::Aggressive => 96,
        }
    }

    fn boost(self) -> f64 {
        match self {
            FollowMode::Light => 0.25,
            FollowMode::Balanced => 0.4,
            FollowMode::Aggressive => 0.5,
        }
    }

    fn max_hops(self) -> u32 {
        match self {
            FollowMode::Light => 1,
            FollowMode::Balanced => 2,
            FollowMode::Aggressive => 4,
        }
    }

    /// File names and path-like tokens also become targets.
    fn heuristics(self) -> bool {
        !matches!(self, FollowMode::Light)
    }

    fn as_str(self) -> &'static str {
        match self {
            FollowMode::Light => "light",
            FollowMode::Balanced => "balanced",
            FollowMode::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for FollowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Searches for the targets of references found in evidence (or, before
/// evidence exists, in candidate snippets) and merges what it finds.
///
/// Each hop extracts targets from the current text, skips targets already
/// searched, and runs one content search per target. New files get a score
/// boost plus `ref_hit`/`ref_hop` metadata. Following stops after
/// `max_hops`, or early when a hop adds nothing new.
///
/// Without an explicit root, the search runs under the deepest directory
/// shared by all candidates.
#[derive(Debug, Clone)]
pub struct ReferenceFollower {
    name: String,
    mode: FollowMode,
    root: Option<PathBuf>,
    patterns: Vec<Regex>,
    pathish: Regex,
    max_targets: usize,
    boost: f64,
    max_hops: u32,
    prune: bool,
    search: Grep,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i){pattern}")).with_context(|| format!("compile reference pattern {pattern}"))
}

impl ReferenceFollower {
    pub fn new(mode: FollowMode) -> Result<Self> {
        let name = "ReferenceFollower".to_string();
        Ok(Self {
            search: Grep::new(".").named(&name),
            name,
            mode,
            root: None,
            patterns: DEFAULT_REF_PATTERNS
                .iter()
                .map(|pattern| compile(pattern))
                .collect::<Result<_>>()?,
            pathish: Regex::new(PATHISH).context("compile path pattern")?,
            max_targets: mode.max_targets(),
            boost: mode.boost(),
            max_hops: mode.max_hops(),
            prune: true,
        })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.search = self.search.named(&self.name);
        self
    }

    pub fn root(mut self, root: Option<PathBuf>) -> Self {
        self.root = root;
        self
    }

    /// Replace the reference patterns.
    pub fn patterns(mut self, patterns: &[&str]) -> Result<Self> {
        self.patterns = patterns
            .iter()
            .map(|pattern| compile(pattern))
            .collect::<Result<_>>()?;
        Ok(self)
    }

    pub fn max_targets(mut self, max: usize) -> Self {
        self.max_targets = max;
        self
    }

    pub fn max_hops(mut self, hops: u32) -> Self {
        self.max_hops = hops;
        self
    }

    /// Keep hopping after a hop that found nothing new.
    pub fn prune(mut self, yes: bool) -> Self {
        self.prune = yes;
        self
    }

    /// Content search used per target; its root is replaced on every run.
    pub fn search(mut self, grep: Grep) -> Self {
        self.search = grep.named(&self.name);
        self
    }

    fn resolve_root(&self, state: &State) -> PathBuf {
        if let Some(root) = &self.root {
            return std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
        }
        let parents: Vec<PathBuf> = state
            .candidates
            .iter()
            .filter_map(Candidate::path)
            .filter_map(|path| path.parent().map(Path::to_path_buf))
            .collect();
        common_root(&parents).unwrap_or_else(|| PathBuf::from("."))
    }

    fn extract_targets(&self, text: &str) -> Vec<String> {
        let mut found = Vec::new();
        for pattern in &self.patterns {
            for hit in pattern.find_iter(text) {
                let token = squash_whitespace(hit.as_str());
                if !found.contains(&token) {
                    found.push(token);
                }
            }
        }
        found
    }

    fn heuristic_targets(&self, state: &State) -> BTreeSet<String> {
        let mut targets = BTreeSet::new();
        for candidate in &state.candidates {
            if let Some(snippet) = &candidate.snippet {
                targets.extend(
                    self.pathish
                        .find_iter(snippet)
                        .map(|hit| squash_whitespace(hit.as_str()))
                        .filter(|token| token.chars().count() > 3),
                );
            }
            let Some(path) = candidate.path() else {
                continue;
            };
            let parent = path.parent().and_then(Path::file_name);
            for part in [path.file_stem(), path.file_name(), parent].into_iter().flatten() {
                let token = squash_whitespace(&part.to_string_lossy());
                if token.chars().count() > 3 {
                    targets.insert(token);
                }
            }
        }
        targets
    }

    fn search_targets(
        &self,
        queries: &[String],
        query: &Query,
        root: &Path,
        hop: u32,
    ) -> Result<Vec<Candidate>, OpError> {
        let grep = self.search.clone().root(root);
        let mut found = Vec::new();
        for target in queries {
            let mut scoped = Query {
                text: target.clone(),
                lang: query.lang.clone(),
                meta: query.meta.clone(),
            };
            scoped.set_search_terms(vec![target.clone()]);
            let searched = grep
                .run(State::new(scoped))
                .map_err(|failure| failure.into_parts().0)?;
            found.extend(searched.candidates.into_iter().map(|candidate| {
                let score = candidate.score + self.boost;
                candidate
                    .with_score(score)
                    .with_meta("ref_hit", json!(target))
                    .with_meta("ref_hop", json!(hop))
            }));
        }
        Ok(found)
    }
}

/// Evidence when present, otherwise every candidate snippet.
fn source_text(state: &State) -> String {
    match state.evidence.as_deref() {
        Some(evidence) if !evidence.trim().is_empty() => evidence.to_string(),
        _ => state
            .candidates
            .iter()
            .filter_map(|candidate| candidate.snippet.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

fn squash_whitespace(token: &str) -> String {
    token.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Each target plus its canonical spellings, deduplicated case-insensitively.
fn expand_targets(targets: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for target in targets {
        out.push(target.clone());
        let lower = target.to_lowercase();
        let number = |prefixes: &[&str]| {
            prefixes
                .iter()
                .find_map(|prefix| lower.strip_prefix(prefix))
                .map(|rest| rest.trim_start().to_string())
                .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        };
        if let Some(num) = number(&["section", "sec.", "§"]) {
            out.extend([format!("Section {num}"), format!("§ {num}"), format!("Sec. {num}")]);
        }
        if let Some(num) = number(&["note"]) {
            out.extend([format!("Note {num}"), format!("See Note {num}")]);
        }
        if let Some(num) = number(&["item"]) {
            out.push(format!("Item {num}"));
        }
    }
    let mut seen = HashSet::new();
    out.retain(|target| seen.insert(target.to_lowercase()));
    out
}

/// Deepest directory shared by every path; the first path when they share nothing.
fn common_root(paths: &[PathBuf]) -> Option<PathBuf> {
    let (first, rest) = paths.split_first()?;
    let mut common: Vec<Component<'_>> = first.components().collect();
    for path in rest {
        let shared = common
            .iter()
            .zip(path.components())
            .take_while(|(left, right)| **left == *right)
            .count();
        common.truncate(shared);
    }
    if common.is_empty() {
        return Some(first.clone());
    }
    Some(common.into_iter().collect())
}

impl Operation for ReferenceFollower {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        let root = self.resolve_root(&state);
        let mut searched: HashSet<String> = HashSet::new();
        let mut seen_uris: HashSet<String> =
            state.candidates.iter().map(|c| c.uri.clone()).collect();
        let (mut targets_total, mut queries_total, mut added) = (0, 0, 0);
        let mut hops = 0;
        let mut error = None;

        while hops < self.max_hops.max(1) {
            let mut targets = self.extract_targets(&source_text(&state));
            if self.mode.heuristics() {
                for target in self.heuristic_targets(&state) {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            }
            let queries: Vec<String> = expand_targets(&targets)
                .into_iter()
                .filter(|query| searched.insert(query.to_lowercase()))
                .take(self.max_targets)
                .collect();
            targets_total += targets.len();
            queries_total += queries.len();
            if queries.is_empty() || !root.exists() {
                break;
            }

            debug!(op = %self.name, hop = hops, queries = queries.len(), "following references");
            let found = match self.search_targets(&queries, &state.query, &root, hops) {
                Ok(found) => found,
                Err(err) if err.is_fatal() => return Err(Failure::new(err, state)),
                Err(err) => {
                    warn!(op = %self.name, hop = hops, error = %err, "reference search failed");
                    error = Some(err);
                    break;
                }
            };
            let fresh: Vec<Candidate> = found
                .into_iter()
                .filter(|candidate| seen_uris.insert(candidate.uri.clone()))
                .collect();
            if fresh.is_empty() && self.prune {
                break;
            }
            added += fresh.len();
            if !fresh.is_empty() {
                let mut merged = std::mem::take(&mut state.candidates);
                merged.extend(fresh);
                state.candidates = dedup_candidates(&merged);
            }
            hops += 1;
        }

        let mut payload = json!({
            "targets": targets_total,
            "queries": queries_total,
            "added": added,
            "hops": hops,
            "mode": self.mode,
            "root": root.display().to_string(),
        });
        if let Some(err) = error {
            payload["error"] = json!(err.kind());
            payload["message"] = json!(err.to_string());
        }
        state.log(&self.name, payload);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Engine;
    use crate::test_support::FileTree;

    fn follower(mode: FollowMode) -> ReferenceFollower {
        ReferenceFollower::new(mode).expect("patterns compile")
    }

    fn seeded(tree: &FileTree, rel: &str) -> State {
        let path = std::fs::canonicalize(tree.path().join(rel)).expect("canonical");
        let text = std::fs::read_to_string(&path).expect("read");
        let mut state = State::new("lease terms");
        state.candidates.push(
            Candidate::new(format!("file://{}", path.display()), "Grep")
                .with_snippet(text.trim())
                .with_score(1.0),
        );
        state
    }

    #[test]
    fn extracts_reference_shapes() {
        let targets = follower(FollowMode::Light).extract_targets(
            "See Note 4b and §  2.3, then Appendix C [12] and #lease-terms; also\nnote\n7",
        );
        for expected in ["See Note 4b", "Note 4b", "§ 2.3", "Appendix C", "[12]", "#lease-terms", "note 7"] {
            assert!(targets.contains(&expected.to_string()), "missing {expected}: {targets:?}");
        }
    }

    #[test]
    fn custom_patterns_replace_the_defaults() {
        let follower = follower(FollowMode::Light)
            .patterns(&[r"Clause\s+\d+"])
            .expect("compile");
        assert_eq!(
            follower.extract_targets("Clause 9 and Note 3"),
            vec!["Clause 9".to_string()]
        );
        assert!(follower.patterns(&["("]).is_err());
    }

    #[test]
    fn targets_expand_to_canonical_spellings() {
        assert_eq!(
            expand_targets(&["§ 2.3".to_string()]),
            vec!["§ 2.3", "Section 2.3", "Sec. 2.3"]
        );
        assert_eq!(
            expand_targets(&["note 7".to_string(), "See Note 7".to_string()]),
            vec!["note 7", "See Note 7"]
        );
        assert_eq!(expand_targets(&["Item 1A".to_string()]), vec!["Item 1A"]);
        assert_eq!(expand_targets(&["Notes".to_string()]), vec!["Notes"]);
    }

    #[test]
    fn heuristics_add_paths_and_file_names() {
        let mut state = State::new("q");
        state.candidates.push(
            Candidate::new("file:///srv/tax/summary.md", "Grep")
                .with_snippet("details in docs/terms.txt"),
        );
        state
            .candidates
            .push(Candidate::new("file:///srv/leases/q3.md", "Grep"));
        let targets = follower(FollowMode::Balanced).heuristic_targets(&state);
        for expected in ["docs/terms.txt", "summary", "summary.md", "leases", "q3.md"] {
            assert!(targets.contains(expected), "missing {expected}: {targets:?}");
        }
        assert!(!targets.contains("tax"));
        assert!(!targets.contains("q3"));
    }

    #[test]
    fn evidence_takes_precedence_over_snippets() {
        let mut state = State::new("q");
        state
            .candidates
            .push(Candidate::new("file:///a.md", "Grep").with_snippet("see Note 1"));
        assert_eq!(source_text(&state), "see Note 1");
        state.evidence = Some("see Item 2".to_string());
        assert_eq!(source_text(&state), "see Item 2");
    }

    #[test]
    fn common_root_is_the_shared_prefix() {
        let paths = [PathBuf::from("/a/b/c"), PathBuf::from("/a/b/d/e")];
        assert_eq!(common_root(&paths), Some(PathBuf::from("/a/b")));
        assert_eq!(common_root(&[]), None);
        let relative = [PathBuf::from("x/y"), PathBuf::from("z")];
        assert_eq!(common_root(&relative), Some(PathBuf::from("x/y")));
    }

    #[test]
    fn nothing_to_follow_leaves_candidates_alone() {
        let mut state = State::new("q");
        state
            .candidates
            .push(Candidate::new("file:///nowhere/a.txt", "Grep").with_snippet("plain text"));
        let out = follower(FollowMode::Light).run(state.clone()).expect("run");
        assert_eq!(out.candidates, state.candidates);
        let event = out.trace.last().expect("event");
        assert_eq!(event.op, "ReferenceFollower");
        assert_eq!(event.payload["hops"], 0);
        assert_eq!(event.payload["added"], 0);
        assert_eq!(event.field("mode"), Some("light"));
    }

    #[test]
    fn follows_a_note_reference_to_another_file() {
        let Some(engine) = Engine::detect() else {
            return;
        };
        let tree = FileTree::new().expect("tree");
        tree.write("a.md", "Lease summary, see Note 14 for details\n")
            .expect("write");
        tree.write("b.md", "Note 14: leases run to 2030\n").expect("write");
        tree.write("c.md", "unrelated\n").expect("write");

        let follower = follower(FollowMode::Light)
            .root(Some(tree.path().to_path_buf()))
            .search(Grep::new(".").engine(Some(engine)));
        let out = follower.run(seeded(&tree, "a.md")).expect("run");

        assert_eq!(out.candidates.len(), 2);
        let hit = out
            .candidates
            .iter()
            .find(|c| c.uri.ends_with("/b.md"))
            .expect("followed");
        assert_eq!(hit.provenance, "ReferenceFollower");
        assert!((hit.score - 1.25).abs() < 1e-9);
        assert_eq!(hit.meta["ref_hop"], 0);
        assert_eq!(hit.meta["ref_hit"], "Note 14");
        let event = out.trace.last().expect("event");
        assert_eq!(event.payload["added"], 1);
        assert_eq!(event.payload["hops"], 1);
    }

    #[test]
    fn later_hops_follow_references_found_by_earlier_hops() {
        let Some(engine) = Engine::detect() else {
            return;
        };
        let tree = FileTree::new().expect("tree");
        tree.write("a.md", "see Note 14 for details\n").expect("write");
        tree.write("b.md", "Note 14: refer to Appendix C\n").expect("write");
        tree.write("c.md", "Appendix C: renewal dates\n").expect("write");

        let follower = follower(FollowMode::Light)
            .max_hops(3)
            .search(Grep::new(".").engine(Some(engine)));
        let out = follower.run(seeded(&tree, "a.md")).expect("run");

        let appendix = out
            .candidates
            .iter()
            .find(|c| c.uri.ends_with("/c.md"))
            .expect("second hop");
        assert_eq!(appendix.meta["ref_hop"], 1);
        let event = out.trace.last().expect("event");
        assert_eq!(event.payload["added"], 2);
        assert_eq!(event.payload["hops"], 2);
    }
}
