//! Query normalization and search-term management.

use serde_json::json;

use crate::core::error::OpResult;
use crate::core::op::Operation;
use crate::core::state::State;

const MIN_TERM_CHARS: usize = 4;
const MAX_TERMS: usize = 6;

/// Default terms added when a search needs widening.
pub const DEFAULT_WIDEN_TERMS: [&str; 4] = ["overview", "summary", "introduction", "appendix"];

/// Tags the query with `ru` when it contains Cyrillic, `en` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageNormalizer;

fn is_cyrillic(c: char) -> bool {
    matches!(c, '\u{0400}'..='\u{04FF}')
}

impl Operation for LanguageNormalizer {
    fn name(&self) -> &str {
        "LanguageNormalizer"
    }

    fn run(&self, mut state: State) -> OpResult {
        let lang = if state.query.text.chars().any(is_cyrillic) {
            "ru"
        } else {
            "en"
        };
        state.query.lang = lang.to_string();
        state.log(self.name(), json!({ "lang": lang }));
        Ok(state)
    }
}

/// Words of at least four letters, digits or hyphens, lowercased, deduplicated.
fn words(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '-')) {
        if word.chars().count() < MIN_TERM_CHARS {
            continue;
        }
        let word = word.to_lowercase();
        if !out.contains(&word) {
            out.push(word);
        }
    }
    out
}

/// Derives `search_terms` from the query text.
///
/// Keeps the longest terms first (ties in order of appearance), at most six.
#[derive(Debug, Clone, Default)]
pub struct SearchTermExtractor {
    pub extra: Vec<String>,
}

impl SearchTermExtractor {
    pub fn new(extra: Vec<String>) -> Self {
        Self { extra }
    }

    pub fn extract(&self, text: &str) -> Vec<String> {
        let mut terms = words(text);
        for term in &self.extra {
            if !terms.contains(term) {
                terms.push(term.clone());
            }
        }
        terms.sort_by_key(|term| std::cmp::Reverse(term.chars().count()));
        terms.truncate(MAX_TERMS);
        terms
    }
}

impl Operation for SearchTermExtractor {
    fn name(&self) -> &str {
        "SearchTermExtractor"
    }

    fn run(&self, mut state: State) -> OpResult {
        let terms = self.extract(&state.query.text);
        state.log(self.name(), json!({ "terms": terms }));
        state.query.set_search_terms(terms);
        Ok(state)
    }
}

/// Adds broader terms to `search_terms`, keeping existing ones first.
#[derive(Debug, Clone)]
pub struct WidenSearchTerms {
    pub extra: Vec<String>,
}

impl Default for WidenSearchTerms {
    fn default() -> Self {
        Self {
            extra: DEFAULT_WIDEN_TERMS.iter().map(|term| term.to_string()).collect(),
        }
    }
}

impl WidenSearchTerms {
    pub fn new(extra: Vec<String>) -> Self {
        Self { extra }
    }
}

impl Operation for WidenSearchTerms {
    fn name(&self) -> &str {
        "WidenSearchTerms"
    }

    fn run(&self, mut state: State) -> OpResult {
        let mut terms = state.query.search_terms();
        let before = terms.len();
        for term in &self.extra {
            if !terms.contains(term) {
                terms.push(term.clone());
            }
        }
        let added = terms.len() - before;
        state.log(self.name(), json!({ "added": added, "terms": terms }));
        state.query.set_search_terms(terms);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Query;

    #[test]
    fn detects_cyrillic_queries() {
        let state = LanguageNormalizer.run(State::new("Какие обязательства по аренде?")).expect("run");
        assert_eq!(state.query.lang, "ru");
        let state = LanguageNormalizer.run(State::new("lease obligations")).expect("run");
        assert_eq!(state.query.lang, "en");
    }

    #[test]
    fn extractor_keeps_longest_unique_terms() {
        let extractor = SearchTermExtractor::default();
        let terms = extractor.extract("What are the Lease obligations in the lease note for FY-2024?");
        assert_eq!(terms[0], "obligations");
        assert!(terms.contains(&"lease".to_string()));
        assert!(terms.contains(&"fy-2024".to_string()));
        assert!(!terms.iter().any(|term| term == "the" || term == "are"));
        assert_eq!(terms.iter().filter(|term| *term == "lease").count(), 1);
    }

    #[test]
    fn extractor_caps_term_count() {
        let extractor = SearchTermExtractor::new(vec!["appendix".to_string()]);
        let terms = extractor.extract("alpha bravo charlie delta echoes foxtrot golfing hotel");
        assert_eq!(terms.len(), 6);
    }

    #[test]
    fn widen_preserves_order_and_skips_duplicates() {
        let mut state = State::new(Query::new("q").with_search_terms(["lease", "summary"]));
        state = WidenSearchTerms::default().run(state).expect("run");
        assert_eq!(
            state.query.search_terms(),
            vec!["lease", "summary", "overview", "introduction", "appendix"]
        );
        assert_eq!(state.trace.events()[0].payload["added"], 3);
    }
}
