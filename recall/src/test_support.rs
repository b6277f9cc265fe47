//! Scripted operations, clocks and file fixtures for tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;

use crate::core::budget::Clock;
use crate::core::error::{Failure, OpError, OpResult};
use crate::core::op::Operation;
use crate::core::state::{Candidate, State};

fn numbered_candidate(provenance: &str, index: usize) -> Candidate {
    Candidate::new(format!("file:///fixture/{index}.txt"), provenance)
        .with_snippet(format!("candidate {index}"))
}

/// Appends one fixture candidate.
#[derive(Debug, Clone, Copy)]
pub struct AddOneCandidate;

impl Operation for AddOneCandidate {
    fn name(&self) -> &str {
        "AddOneCandidate"
    }

    fn run(&self, mut state: State) -> OpResult {
        let index = state.candidates.len();
        state
            .candidates
            .push(numbered_candidate(self.name(), index));
        state.log(self.name(), json!({ "added": 1 }));
        Ok(state)
    }
}

/// Drops every candidate.
#[derive(Debug, Clone, Copy)]
pub struct AlwaysEmpty;

impl Operation for AlwaysEmpty {
    fn name(&self) -> &str {
        "AlwaysEmpty"
    }

    fn run(&self, mut state: State) -> OpResult {
        state.candidates = Vec::new();
        state.log(self.name(), json!({ "candidates": 0 }));
        Ok(state)
    }
}

/// Replaces the candidates with exactly one.
#[derive(Debug, Clone, Copy)]
pub struct AlwaysOneCandidate;

impl Operation for AlwaysOneCandidate {
    fn name(&self) -> &str {
        "AlwaysOneCandidate"
    }

    fn run(&self, mut state: State) -> OpResult {
        state.candidates = vec![numbered_candidate(self.name(), 0)];
        state.log(self.name(), json!({ "candidates": 1 }));
        Ok(state)
    }
}

#[derive(Debug, Clone, Copy)]
enum FailureMode {
    Transient,
    Timeout,
    Logic,
}

/// Logs one event, then fails with a fixed error kind.
#[derive(Debug, Clone)]
pub struct FailingOp {
    name: String,
    mode: FailureMode,
}

impl FailingOp {
    pub fn transient(name: &str) -> Self {
        Self::with_mode(name, FailureMode::Transient)
    }

    pub fn timeout(name: &str) -> Self {
        Self::with_mode(name, FailureMode::Timeout)
    }

    pub fn logic(name: &str) -> Self {
        Self::with_mode(name, FailureMode::Logic)
    }

    fn with_mode(name: &str, mode: FailureMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
        }
    }
}

impl Operation for FailingOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        state.log(&self.name, json!({ "failing": format!("{:?}", self.mode) }));
        let error = match self.mode {
            FailureMode::Transient => OpError::transient(&self.name, "scripted failure"),
            FailureMode::Timeout => OpError::Timeout {
                op: self.name.clone(),
                after: Duration::from_millis(10),
            },
            FailureMode::Logic => OpError::logic(&self.name, "scripted bug"),
        };
        Err(Failure::new(error, state))
    }
}

/// Fails transiently for the first `fails` calls, then adds one candidate.
#[derive(Debug)]
pub struct FlakyOp {
    name: String,
    fails: usize,
    calls: AtomicUsize,
}

impl FlakyOp {
    pub fn new(name: &str, fails: usize) -> Self {
        Self {
            name: name.to_string(),
            fails,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Operation for FlakyOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        state.log(&self.name, json!({ "call": call + 1 }));
        if call < self.fails {
            return Err(Failure::new(
                OpError::transient(&self.name, "flaky"),
                state,
            ));
        }
        let index = state.candidates.len();
        state.candidates.push(numbered_candidate(&self.name, index));
        Ok(state)
    }
}

/// Adds nothing for the first `skip` calls, then one candidate per call.
#[derive(Debug)]
pub struct WarmupOp {
    name: String,
    skip: usize,
    calls: AtomicUsize,
}

impl WarmupOp {
    pub fn new(name: &str, skip: usize) -> Self {
        Self {
            name: name.to_string(),
            skip,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Operation for WarmupOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let warm = call >= self.skip;
        if warm {
            let index = state.candidates.len();
            state.candidates.push(numbered_candidate(&self.name, index));
        }
        state.log(&self.name, json!({ "added": usize::from(warm) }));
        Ok(state)
    }
}

/// Passes the state through and counts invocations.
#[derive(Debug)]
pub struct CountingOp {
    name: String,
    calls: AtomicUsize,
}

impl CountingOp {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Operation for CountingOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, mut state: State) -> OpResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        state.log(&self.name, json!({ "call": call }));
        Ok(state)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Operation that simulates work by advancing a [`ManualClock`].
#[derive(Debug, Clone)]
pub struct AdvanceClock {
    clock: Arc<ManualClock>,
    step: Duration,
}

impl AdvanceClock {
    pub fn new(clock: Arc<ManualClock>, step: Duration) -> Self {
        Self { clock, step }
    }
}

impl Operation for AdvanceClock {
    fn name(&self) -> &str {
        "AdvanceClock"
    }

    fn run(&self, mut state: State) -> OpResult {
        self.clock.advance(self.step);
        state.log(self.name(), json!({ "advanced_ms": self.step.as_millis() as u64 }));
        Ok(state)
    }
}

/// Temporary directory populated with text files.
pub struct FileTree {
    temp: tempfile::TempDir,
}

impl FileTree {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp file tree")?;
        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Write `contents` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, contents: &str) -> Result<PathBuf> {
        let path = self.temp.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
