//! Side-effecting helpers: configuration, child processes, run history, trace export.

pub mod config;
pub mod history;
pub mod process;
pub mod trace_export;
