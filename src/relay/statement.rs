//! Statement bookkeeping and server-side prepared-statement caching.
//!
//! This module provides:
//! - `count_placeholders`: local bind-arity derivation from statement text
//! - `StatementEntry`: a statement owned by a session, with bind-name lookup
//! - `PreparedCache`: O(1) LRU map of statements prepared on the current link

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::handles::{CursorHandle, StatementHandle};

// ============================================================================
// Placeholder counting
// ============================================================================

/// Count bind placeholders in `text`.
///
/// Quoted strings, quoted identifiers and comments are skipped. `?` counts
/// every occurrence, `$n` counts as the highest `n` seen and `:name` counts
/// each distinct name once. `::` casts are not placeholders.
pub fn count_placeholders(text: &str) -> usize {
    Placeholders::scan(text).count()
}

/// Placeholders found in a statement text.
///
/// Bind values are positional on the wire: `?` and `$n` slots first, then
/// one slot per distinct `:name` in order of first appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Placeholders {
    unnamed: usize,
    names: Vec<String>,
}

impl Placeholders {
    pub(crate) fn count(&self) -> usize {
        self.unnamed + self.names.len()
    }

    /// Zero-based bind slot for `name`.
    ///
    /// Accepts `:name`, `name`, or a 1-based position such as `"2"` or `"$2"`.
    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        let bare = name.trim_start_matches([':', '$', '@']);
        if let Some(i) = self.names.iter().position(|n| n == bare) {
            return Some(self.unnamed + i);
        }
        match bare.parse::<usize>() {
            Ok(n) if n >= 1 && n <= self.count() => Some(n - 1),
            _ => None,
        }
    }

    fn scan(text: &str) -> Self {
        let bytes = text.as_bytes();
        let mut positional = 0usize;
        let mut highest_numbered = 0usize;
        let mut names: Vec<String> = Vec::new();

        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                quote @ (b'\'' | b'"' | b'`') => {
                    i += 1;
                    while i < bytes.len() {
                        if bytes[i] == quote {
                            // Doubled quote is an escaped quote
                            if bytes.get(i + 1) == Some(&quote) {
                                i += 2;
                                continue;
                            }
                            break;
                        }
                        i += 1;
                    }
                    i += 1;
                }
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    while i < bytes.len() && bytes[i] != b'\n' {
                        i += 1;
                    }
                }
                b'/' if bytes.get(i + 1) == Some(&b'*') => {
                    i += 2;
                    while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                        i += 1;
                    }
                    i += 2;
                }
                b'?' => {
                    positional += 1;
                    i += 1;
                }
                b'$' => {
                    let start = i + 1;
                    let end = scan(bytes, start, |b| b.is_ascii_digit());
                    if let Ok(n) = text[start..end].parse::<usize>() {
                        highest_numbered = highest_numbered.max(n);
                    }
                    i = end.max(i + 1);
                }
                b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
                b':' => {
                    let start = i + 1;
                    let first_ok = bytes
                        .get(start)
                        .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_');
                    if first_ok {
                        let end = scan(bytes, start, |b| b.is_ascii_alphanumeric() || b == b'_');
                        let name = &text[start..end];
                        if !names.iter().any(|n| n == name) {
                            names.push(name.to_string());
                        }
                        i = end;
                    } else {
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        }

        Self {
            unnamed: positional + highest_numbered,
            names,
        }
    }
}

fn scan(bytes: &[u8], start: usize, accept: impl Fn(u8) -> bool) -> usize {
    let mut end = start;
    while end < bytes.len() && accept(bytes[end]) {
        end += 1;
    }
    end
}

// ============================================================================
// Statement entries
// ============================================================================

/// A statement owned by a session.
#[derive(Debug, Clone)]
pub(crate) struct StatementEntry {
    /// Opaque command text, shared with in-flight executions
    pub text: Arc<str>,
    /// Placeholder count derived locally at prepare time
    pub param_count: usize,
    pub placeholders: Placeholders,
    /// Cursor produced by the latest execution, if still open
    pub cursor: Option<CursorHandle>,
}

impl StatementEntry {
    pub(crate) fn new(text: &str) -> Self {
        let placeholders = Placeholders::scan(text);
        Self {
            text: Arc::from(text),
            param_count: placeholders.count(),
            placeholders,
            cursor: None,
        }
    }
}

// ============================================================================
// Prepared statement cache (O(1) LRU)
// ============================================================================

/// Statements prepared on the current link, keyed by handle.
///
/// Server ids are only valid for the link they were prepared on, so the
/// cache is cleared whenever the session reconnects. Inserting past capacity
/// evicts the least recently used entry and hands its server id back so the
/// caller can release it on the proxy.
pub(crate) struct PreparedCache {
    cache: LruCache<StatementHandle, u64>,
}

impl PreparedCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Look up the server id and mark the statement as recently used.
    pub(crate) fn get(&mut self, statement: &StatementHandle) -> Option<u64> {
        self.cache.get(statement).copied()
    }

    /// Record a server id. Returns the server id of the evicted entry, if any.
    pub(crate) fn insert(&mut self, statement: StatementHandle, server_id: u64) -> Option<u64> {
        match self.cache.push(statement, server_id) {
            Some((evicted, id)) if evicted != statement => Some(id),
            _ => None,
        }
    }

    pub(crate) fn remove(&mut self, statement: &StatementHandle) -> Option<u64> {
        self.cache.pop(statement)
    }

    pub(crate) fn clear(&mut self) {
        self.cache.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::handles::HandleTable;
    use uuid::Uuid;

    #[test]
    fn test_question_marks_count_each() {
        assert_eq!(count_placeholders("insert into t values (?, ?, ?)"), 3);
        assert_eq!(count_placeholders("select 1"), 0);
    }

    #[test]
    fn test_numbered_counts_highest() {
        assert_eq!(count_placeholders("select $1, $2, $1"), 2);
        assert_eq!(count_placeholders("select $3"), 3);
        assert_eq!(count_placeholders("select '$'||x"), 0);
    }

    #[test]
    fn test_named_counts_distinct() {
        assert_eq!(
            count_placeholders("update t set a = :a, b = :b where a = :a"),
            2
        );
        assert_eq!(count_placeholders("select x::int from t where y = :y"), 1);
    }

    #[test]
    fn test_quotes_and_comments_skipped() {
        let sql = "select '?', \"?col\", 'it''s ?' -- trailing ?\n\
                   from t /* ? :skip */ where a = ?";
        assert_eq!(count_placeholders(sql), 1);
    }

    #[test]
    fn test_bind_positions_by_name() {
        let entry = StatementEntry::new("insert into t values (:var1, :var2, :var1, :var3)");
        assert_eq!(entry.param_count, 3);
        assert_eq!(entry.placeholders.position("var1"), Some(0));
        assert_eq!(entry.placeholders.position(":var3"), Some(2));
        assert_eq!(entry.placeholders.position("3"), Some(2));
        assert_eq!(entry.placeholders.position("var4"), None);
        assert_eq!(entry.placeholders.position("0"), None);
        assert_eq!(entry.placeholders.position("4"), None);
    }

    #[test]
    fn test_bind_positions_by_number() {
        let entry = StatementEntry::new("select ? from t where a = ? and b = :b");
        assert_eq!(entry.placeholders.position("1"), Some(0));
        assert_eq!(entry.placeholders.position("$2"), Some(1));
        // Named slots follow the positional ones
        assert_eq!(entry.placeholders.position("b"), Some(2));
    }

    #[test]
    fn test_unterminated_quote_does_not_panic() {
        assert_eq!(count_placeholders("select 'abc ?"), 0);
        assert_eq!(count_placeholders("select /* ?"), 0);
        assert_eq!(count_placeholders("select :"), 0);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut table = HandleTable::new(Uuid::new_v4(), "statement");
        let s1 = StatementHandle(table.insert(()));
        let s2 = StatementHandle(table.insert(()));
        let s3 = StatementHandle(table.insert(()));

        let mut cache = PreparedCache::new(2);
        assert!(cache.insert(s1, 10).is_none());
        assert!(cache.insert(s2, 20).is_none());

        // Touch s1 so s2 becomes least recently used
        assert_eq!(cache.get(&s1), Some(10));
        assert_eq!(cache.insert(s3, 30), Some(20));

        assert_eq!(cache.get(&s2), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_reinsert_same_key_evicts_nothing() {
        let mut table = HandleTable::new(Uuid::new_v4(), "statement");
        let s1 = StatementHandle(table.insert(()));

        let mut cache = PreparedCache::new(1);
        cache.insert(s1, 1);
        assert_eq!(cache.insert(s1, 2), None);
        assert_eq!(cache.remove(&s1), Some(2));
        assert!(cache.is_empty());
    }
}
