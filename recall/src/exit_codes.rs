//! Stable exit codes for recall CLI commands.

/// Command succeeded; for `ask`, every pipeline step completed.
pub const OK: i32 = 0;
/// Invalid arguments, configuration or filesystem layout.
pub const INVALID: i32 = 1;
/// The pipeline stopped on an unrecovered failure.
pub const FAILED: i32 = 2;
/// An answer was produced with reduced effort (budget, stall or unhealed search).
pub const DEGRADED: i32 = 3;
