//! Default leaf operations for searching a live file tree.
//!
//! Each is stateless apart from its construction-time configuration and
//! appends exactly one trace event per run.

pub mod answer;
pub mod rank;
pub mod refs;
pub mod search;
pub mod terms;

pub use answer::ComposeAnswer;
pub use rank::{Concat, ContextEnricher, Deduplicate, Ranking};
pub use refs::{FollowMode, ReferenceFollower};
pub use search::{Engine, Glob, Grep};
pub use terms::{LanguageNormalizer, SearchTermExtractor, WidenSearchTerms};
