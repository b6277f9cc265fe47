//! The control-flow and resilience engine.
//!
//! Everything here is pure apart from reading the clock and sleeping for
//! retry backoff. Operations take a [`state::State`] by value and hand it back
//! (or a typed [`error::Failure`]); composites nest freely because they
//! implement the same [`op::Operation`] contract as the leaves they wrap.

pub mod branch;
pub mod budget;
pub mod error;
pub mod heal;
pub mod looping;
pub mod op;
pub mod route;
pub mod stack;
pub mod stagnation;
pub mod state;
