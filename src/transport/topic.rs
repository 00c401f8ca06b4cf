//! Topic routing-key patterns.
//!
//! Keys are dot-separated words. In binding patterns `*` matches exactly one
//! word and `#` matches zero or more words.

use crate::error::TransportError;

/// Checks that `pattern` is a well-formed topic binding key.
///
/// Words must be non-empty; `*` and `#` must stand alone as a word.
pub fn validate_pattern(pattern: &str) -> Result<(), TransportError> {
    if pattern.is_empty() {
        return Err(TransportError::invalid("binding key is empty"));
    }
    for word in pattern.split('.') {
        if word.is_empty() {
            return Err(TransportError::invalid(format!(
                "binding key {pattern:?} has an empty word"
            )));
        }
        if word.len() > 1 && (word.contains('*') || word.contains('#')) {
            return Err(TransportError::invalid(format!(
                "binding key {pattern:?}: wildcard must be a whole word, got {word:?}"
            )));
        }
    }
    Ok(())
}

/// Returns true if routing key `key` matches binding `pattern`.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    };
    match_words(&pattern, &key)
}

/// Runs in `O(pattern * key)`: `reachable[i]` says whether the pattern words
/// seen so far can consume exactly the first `i` key words.
fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    let mut reachable = vec![false; key.len() + 1];
    reachable[0] = true;
    for &word in pattern {
        if word == "#" {
            for i in 1..reachable.len() {
                reachable[i] |= reachable[i - 1];
            }
            continue;
        }
        for i in (1..reachable.len()).rev() {
            reachable[i] = reachable[i - 1] && (word == "*" || word == key[i - 1]);
        }
        reachable[0] = false;
    }
    reachable[key.len()]
}
