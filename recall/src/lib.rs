//! Index-free search and reasoning pipelines over a live file tree.
//!
//! The crate is split the same way a pipeline is:
//!
//! - **[`core`]**: The engine. Execution state, the operation contract and the
//!   composites (sequencing, fan-out, self-healing, stall detection, bounded
//!   loops, budgets, routing). No I/O apart from the clock and backoff sleeps.
//! - **[`ops`]**: Default leaf operations (content search, globbing, ranking,
//!   evidence assembly, answer rendering). They plug into the engine through
//!   the same [`core::op::Operation`] trait as any caller-defined step.
//! - **[`io`]**: Configuration, child processes and run history.
//!
//! [`pipeline`] wires these into the pipeline the `recall` binary runs.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod ops;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
