//! Live file-tree search: content matches through an external engine, and path discovery.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::json;
use tracing::{debug, instrument};

use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::Operation;
use crate::core::state::{Candidate, State};
use crate::io::process::{find_on_path, run_command_with_timeout};

/// Paths matching this pattern are never reported as content matches.
pub const DEFAULT_IGNORE: &str = r"\.(png|jpg|jpeg|gif|pdf|bin|exe|zip|gz|so|dylib)$";

/// External content search program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Engine {
    Ripgrep(PathBuf),
    Grep(PathBuf),
}

impl Engine {
    /// `rg` if installed, else `grep`.
    pub fn detect() -> Option<Engine> {
        find_on_path("rg")
            .map(Engine::Ripgrep)
            .or_else(|| find_on_path("grep").map(Engine::Grep))
    }

    fn label(&self) -> &'static str {
        match self {
            Engine::Ripgrep(_) => "rg",
            Engine::Grep(_) => "grep",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug)]
struct Hit {
    path: PathBuf,
    line: u64,
}

/// Fixed-string content search for every search term under one root.
///
/// Terms come from `query.meta.search_terms`, falling back to the query text.
/// Existing `path_hints` under the root replace the root as search bases.
/// Both exit codes 0 and 1 count as success (1 means no matches).
#[derive(Debug, Clone)]
pub struct Grep {
    name: String,
    root: PathBuf,
    engine: Option<Engine>,
    file_glob: Option<String>,
    ignore: Option<Regex>,
    context: usize,
    case_insensitive: bool,
    respect_path_hints: bool,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl Grep {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: "Grep".to_string(),
            root: root.into(),
            engine: Engine::detect(),
            file_glob: None,
            ignore: None,
            context: 2,
            case_insensitive: true,
            respect_path_hints: true,
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1_000_000,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn engine(mut self, engine: Option<Engine>) -> Self {
        self.engine = engine;
        self
    }

    /// Restrict matches to files matching `glob`; `**/*` means no restriction.
    pub fn file_glob(mut self, glob: Option<String>) -> Self {
        self.file_glob = glob.filter(|glob| !glob.is_empty() && glob != "**/*");
        self
    }

    pub fn ignore(mut self, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).with_context(|| format!("compile ignore pattern {pattern}"))?;
        self.ignore = Some(regex);
        Ok(self)
    }

    pub fn context_lines(mut self, lines: usize) -> Self {
        self.context = lines;
        self
    }

    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    pub fn respect_path_hints(mut self, yes: bool) -> Self {
        self.respect_path_hints = yes;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output_limit_bytes(mut self, limit: usize) -> Self {
        self.output_limit_bytes = limit;
        self
    }

    fn bases(&self, state: &State) -> Vec<PathBuf> {
        let hinted: Vec<PathBuf> = if self.respect_path_hints {
            state
                .query
                .path_hints()
                .into_iter()
                .map(|hint| self.root.join(hint))
                .filter(|path| path.exists())
                .collect()
        } else {
            Vec::new()
        };
        let candidates = if hinted.is_empty() {
            vec![self.root.clone()]
        } else {
            hinted
        };

        let mut bases: Vec<PathBuf> = Vec::new();
        for base in candidates {
            let base = fs::canonicalize(&base).unwrap_or(base);
            if !bases.contains(&base) {
                bases.push(base);
            }
        }
        bases
    }

    fn command(&self, engine: &Engine, term: &str, base: &Path) -> Command {
        match engine {
            Engine::Ripgrep(program) => {
                let mut cmd = Command::new(program);
                cmd.args([
                    "--no-heading",
                    "--with-filename",
                    "--line-number",
                    "--color",
                    "never",
                    "--fixed-strings",
                    "--null",
                ]);
                if self.case_insensitive {
                    cmd.arg("-i");
                }
                if let Some(glob) = &self.file_glob {
                    cmd.arg("--glob").arg(glob);
                }
                cmd.arg("--").arg(term).arg(base);
                cmd
            }
            Engine::Grep(program) => {
                let mut cmd = Command::new(program);
                cmd.args(["-R", "-n", "-H", "-F", "-I", "--null"]);
                if self.case_insensitive {
                    cmd.arg("-i");
                }
                if let Some(glob) = &self.file_glob {
                    cmd.arg("--include").arg(glob);
                }
                cmd.arg("--").arg(term).arg(base);
                cmd
            }
        }
    }

    #[instrument(skip_all, fields(engine = %engine, term = %term))]
    fn search_term(&self, engine: &Engine, term: &str, base: &Path) -> Result<Vec<Hit>, OpError> {
        let cmd = self.command(engine, term, base);
        let output = run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            .map_err(|err| OpError::transient(&self.name, err))?;
        if output.timed_out {
            return Err(OpError::transient(
                &self.name,
                format!("{engine} timed out after {:?}", self.timeout),
            ));
        }
        match output.status.code() {
            Some(0 | 1) => {}
            code => {
                return Err(OpError::transient(
                    &self.name,
                    format!("{engine} exited with {code:?}: {}", output.stderr_text()),
                ));
            }
        }

        let hits: Vec<Hit> = output
            .stdout_lines()
            .iter()
            .filter_map(|line| parse_hit(line))
            .map(|(path, line)| {
                let path = if path.is_absolute() {
                    path
                } else {
                    base.join(path)
                };
                Hit { path, line }
            })
            .filter(|hit| {
                self.ignore
                    .as_ref()
                    .is_none_or(|ignore| !ignore.is_match(&hit.path.to_string_lossy()))
            })
            .collect();
        debug!(hits = hits.len(), "term searched");
        Ok(hits)
    }
}

/// Split `path\0line:text` engine output (both engines run with `--null`).
fn parse_hit(line: &str) -> Option<(PathBuf, u64)> {
    let (path, rest) = line.split_once('\0')?;
    let (line_no, _) = rest.split_once(':')?;
    if path.is_empty() {
        return None;
    }
    Some((PathBuf::from(path), line_no.parse().ok()?))
}

/// Lines `line ± context` (1-based `line`) of `lines`.
fn snippet(lines: &[String], line: u64, context: usize) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let index = usize::try_from(line.saturating_sub(1)).unwrap_or(usize::MAX);
    let start = index.saturating_sub(context).min(lines.len());
    let end = index.saturating_add(context).saturating_add(1).min(lines.len());
    lines[start..end].join("\n")
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read(path)
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Operation for Grep {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        let Some(engine) = &self.engine else {
            let error = OpError::logic(&self.name, "neither rg nor grep is available on PATH");
            return Err(Failure::new(error, state));
        };

        let mut terms: Vec<String> = state
            .query
            .search_terms()
            .into_iter()
            .map(|term| term.trim().to_string())
            .filter(|term| !term.is_empty())
            .collect();
        if terms.is_empty() {
            terms.push(state.query.text.trim().to_string());
        }
        let bases = self.bases(&state);

        let mut cache: HashMap<PathBuf, Vec<String>> = HashMap::new();
        let mut found = Vec::new();
        for term in terms.iter().filter(|term| !term.is_empty()) {
            for base in &bases {
                let hits = match self.search_term(engine, term, base) {
                    Ok(hits) => hits,
                    Err(error) => {
                        state.log(
                            &self.name,
                            json!({
                                "error": error.kind(),
                                "term": term,
                                "base": base.display().to_string(),
                            }),
                        );
                        return Err(Failure::new(error, state));
                    }
                };
                for hit in hits {
                    let lines = cache
                        .entry(hit.path.clone())
                        .or_insert_with(|| read_lines(&hit.path));
                    let text = snippet(lines, hit.line, self.context);
                    found.push(
                        Candidate::new(format!("file://{}", hit.path.display()), &self.name)
                            .with_line(hit.line)
                            .with_snippet(text)
                            .with_score(1.0)
                            .with_meta("term", json!(term)),
                    );
                }
            }
        }

        state.log(
            &self.name,
            json!({
                "matches": found.len(),
                "terms": terms.len(),
                "bases": bases.len(),
                "engine": engine.label(),
            }),
        );
        state.candidates.extend(found);
        Ok(state)
    }
}

/// Path discovery under a root; every matching file becomes a low-score candidate.
///
/// Newer files score slightly higher.
#[derive(Debug, Clone)]
pub struct Glob {
    name: String,
    root: PathBuf,
    pattern: String,
}

impl Glob {
    pub fn new(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            name: "Glob".to_string(),
            root: root.into(),
            pattern: pattern.into(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn discover(&self) -> Result<Vec<Candidate>, OpError> {
        let pattern = self.root.join(&self.pattern);
        let pattern = pattern.to_string_lossy();
        let paths = glob::glob(&pattern)
            .map_err(|err| OpError::logic(&self.name, format!("invalid glob {pattern}: {err}")))?;

        let mut found = Vec::new();
        for path in paths.filter_map(Result::ok) {
            let Ok(meta) = path.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let mtime = meta
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map_or(0.0, |age| age.as_secs_f64());
            found.push(
                Candidate::new(format!("file://{}", path.display()), &self.name)
                    .with_score(0.2 + mtime / 1e12)
                    .with_meta("mtime", json!(mtime)),
            );
        }
        Ok(found)
    }
}

impl Operation for Glob {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        match self.discover() {
            Ok(found) => {
                state.log(
                    &self.name,
                    json!({ "files": found.len(), "pattern": self.pattern }),
                );
                state.candidates.extend(found);
                Ok(state)
            }
            Err(error) => Err(Failure::new(error, state)),
        }
    }
}
