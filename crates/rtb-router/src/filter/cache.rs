//! Regex compilation and per-request decision caching.
//!
//! Compiled regexes are process-lifetime: compilation is expensive and the
//! set of patterns is bounded by what agents configure, so entries are
//! interned globally and never evicted. Decisions, by contrast, are cached
//! per request: thousands of agents share a handful of patterns, and each
//! (pattern, request-field) pair must be evaluated at most once per filter
//! pass.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;

use rtb_common::agent_config::PatternIncludeExclude;
use rtb_common::bid_request::BidRequest;
use rtb_common::ids::md5_hash64;

/// Process-lifetime compiled-regex intern table, keyed by pattern hash.
static COMPILED: Lazy<Mutex<HashMap<u64, Option<Arc<Regex>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Stable 64-bit hash of a pattern string.
pub fn pattern_hash(pattern: &str) -> u64 {
    md5_hash64(pattern.as_bytes())
}

/// Compile (or fetch the interned copy of) a pattern.
///
/// A pattern that fails to compile is interned as `None` so the failure is
/// paid once; publish-time validation makes this unreachable for configs
/// that went through the registry.
pub fn compiled(pattern: &str) -> Option<Arc<Regex>> {
    let key = pattern_hash(pattern);
    let mut table = COMPILED.lock();
    table
        .entry(key)
        .or_insert_with(|| Regex::new(pattern).ok().map(Arc::new))
        .clone()
}

/// Check that every pattern in an include/exclude pair compiles.
pub fn validate_patterns(patterns: &PatternIncludeExclude) -> Result<(), regex::Error> {
    for pattern in patterns.include.iter().chain(&patterns.exclude) {
        // Compile through the intern table so valid patterns are warm
        // by the time the first request arrives.
        if compiled(pattern).is_none() {
            return Err(Regex::new(pattern).expect_err("pattern failed once already"));
        }
    }
    Ok(())
}

/// Request-scoped filter cache.
///
/// Holds the pre-computed hashes of the request fields the regex filters
/// run over, plus one decision map per field. Lives exactly as long as one
/// filter pass.
#[derive(Debug)]
pub struct RequestFilterCache {
    pub url: String,
    pub url_hash: u64,
    pub language: String,
    pub language_hash: u64,
    pub location: String,
    pub location_hash: u64,

    url_decisions: HashMap<u64, bool>,
    language_decisions: HashMap<u64, bool>,
    location_decisions: HashMap<u64, bool>,
}

impl RequestFilterCache {
    pub fn new(request: &BidRequest) -> Self {
        let language = if request.language.is_empty() {
            "unspecified".to_string()
        } else {
            request.language.clone()
        };
        let location = request.location.full_location_string();
        Self {
            url_hash: md5_hash64(request.url.as_bytes()),
            url: request.url.clone(),
            language_hash: md5_hash64(language.as_bytes()),
            language,
            location_hash: md5_hash64(location.as_bytes()),
            location,
            url_decisions: HashMap::new(),
            language_decisions: HashMap::new(),
            location_decisions: HashMap::new(),
        }
    }

    pub fn url_accepts(&mut self, patterns: &PatternIncludeExclude) -> bool {
        accepts(patterns, &self.url, &mut self.url_decisions)
    }

    pub fn language_accepts(&mut self, patterns: &PatternIncludeExclude) -> bool {
        accepts(patterns, &self.language, &mut self.language_decisions)
    }

    pub fn location_accepts(&mut self, patterns: &PatternIncludeExclude) -> bool {
        accepts(patterns, &self.location, &mut self.location_decisions)
    }
}

fn pattern_matches(pattern: &str, text: &str, decisions: &mut HashMap<u64, bool>) -> bool {
    let key = pattern_hash(pattern);
    if let Some(&decision) = decisions.get(&key) {
        return decision;
    }
    let decision = match compiled(pattern) {
        Some(re) => re.is_match(text),
        None => false,
    };
    decisions.insert(key, decision);
    decision
}

fn accepts(patterns: &PatternIncludeExclude, text: &str, decisions: &mut HashMap<u64, bool>) -> bool {
    if patterns
        .exclude
        .iter()
        .any(|p| pattern_matches(p, text, decisions))
    {
        return false;
    }
    patterns.include.is_empty()
        || patterns
            .include
            .iter()
            .any(|p| pattern_matches(p, text, decisions))
}
