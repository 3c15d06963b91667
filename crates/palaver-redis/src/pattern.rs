//! Wildcard channel matching.
//!
//! # Purpose
//! Compiles wildcard channels (`*` one segment, `**` one or more segments)
//! into anchored regexes and memoizes the compiled form per pattern, so a hot
//! pattern is compiled exactly once per engine instance.
//!
//! # Design notes
//! Wildcards are recognized segment-wise: a segment that is exactly `*` or
//! `**` is a wildcard, anything else is a literal (regex metacharacters
//! included). A star embedded inside a segment (`/a*b`, `/foo**bar`) is kept
//! literal rather than rejected, so such a pattern only ever matches its own
//! spelling.
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

/// Compile a wildcard channel into an anchored regex. `None` means the
/// pattern can never match (compile failure).
pub fn compile(pattern: &str) -> Option<Regex> {
    let body = pattern
        .split('/')
        .map(|segment| match segment {
            "**" => ".*".to_string(),
            "*" => "[^/]+".to_string(),
            literal => regex::escape(literal),
        })
        .collect::<Vec<_>>()
        .join("/");
    Regex::new(&format!("^{body}$")).ok()
}

/// Memo of `pattern -> compiled regex`, private to the subscription manager.
///
/// Entries must be evicted whenever the owning pattern leaves the `patterns`
/// Set, otherwise a stale regex keeps a matcher alive for a dead pattern.
#[derive(Debug, Default)]
pub struct PatternCache {
    // None records a pattern that failed to compile; it stays non-matching
    // and is only logged on the first attempt.
    compiled: Mutex<HashMap<String, Option<Regex>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Does `channel` match `pattern`? Invalid patterns never match.
    pub fn matches(&self, channel: &str, pattern: &str) -> bool {
        let mut compiled = self.compiled.lock().expect("pattern cache lock");
        let entry = compiled.entry(pattern.to_string()).or_insert_with(|| {
            let regex = compile(pattern);
            if regex.is_none() {
                warn!(pattern, "wildcard pattern failed to compile; treating as non-matching");
            }
            regex
        });
        entry
            .as_ref()
            .is_some_and(|regex| regex.is_match(channel))
    }

    /// Drop the compiled entry for a pattern that left the pattern set.
    pub fn evict(&self, pattern: &str) {
        self.compiled
            .lock()
            .expect("pattern cache lock")
            .remove(pattern);
    }

    #[cfg(test)]
    fn contains(&self, pattern: &str) -> bool {
        self.compiled
            .lock()
            .expect("pattern cache lock")
            .contains_key(pattern)
    }
}
