//! Per-site document state: text buffer plus append-only applied log.
//!
//! The log is kept in local application order and indexed by operation id so
//! that duplicate deliveries are detected in O(1).

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::operation::Operation;

/// Text buffer and applied-operation log for one (site, document) pair.
#[derive(Debug, Clone, Default)]
pub struct DocumentState {
    buffer: String,
    applied_log: Vec<Operation>,
    applied_ids: HashSet<String>,
    /// Highest applied timestamp per author site.
    frontier: HashMap<String, u64>,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing text with an empty log.
    pub fn with_text(text: impl Into<String>) -> Self {
        Self {
            buffer: text.into(),
            ..Self::default()
        }
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Buffer length in characters.
    pub fn char_len(&self) -> usize {
        self.buffer.chars().count()
    }

    pub fn applied_log(&self) -> &[Operation] {
        &self.applied_log
    }

    pub fn applied_count(&self) -> usize {
        self.applied_log.len()
    }

    pub fn has_applied(&self, id: &str) -> bool {
        self.applied_ids.contains(id)
    }

    /// Apply an operation whose position is valid for the current buffer.
    ///
    /// Offsets past the end are clamped; this never fails. The operation is
    /// logged as clamped, and even when it is a no-op.
    pub fn apply(&mut self, op: Operation) -> &str {
        let op = self.clamp(op);
        if !op.is_noop() {
            let start = byte_offset(&self.buffer, op.position());
            let end = if op.kind().removes() {
                start + byte_offset(&self.buffer[start..], op.length())
            } else {
                start
            };
            self.buffer.replace_range(start..end, op.content());
        }
        self.record(op);
        &self.buffer
    }

    /// `op` with its position and removed length limited to the buffer.
    pub fn clamp(&self, mut op: Operation) -> Operation {
        let len = self.char_len();
        let position = op.position().min(len);
        op.set_position(position);
        op.set_length(op.length().min(len - position));
        op
    }

    /// Applied operations with `timestamp > since`, in application order.
    pub fn recent_window(&self, since: u64) -> Vec<&Operation> {
        self.applied_log
            .iter()
            .filter(|op| op.timestamp() > since)
            .collect()
    }

    /// The last `count` applied operations, in application order.
    pub fn recent_ops(&self, count: usize) -> &[Operation] {
        let start = self.applied_log.len().saturating_sub(count);
        &self.applied_log[start..]
    }

    /// Highest applied timestamp per foreign site, excluding `site_id`.
    pub fn frontier_excluding(&self, site_id: &str) -> BTreeMap<String, u64> {
        self.frontier
            .iter()
            .filter(|(site, _)| site.as_str() != site_id)
            .map(|(site, ts)| (site.clone(), *ts))
            .collect()
    }

    /// Replace buffer and log wholesale (version restore).
    pub fn reset(&mut self, document: impl Into<String>, operations: Vec<Operation>) {
        self.buffer = document.into();
        self.applied_log = Vec::with_capacity(operations.len());
        self.applied_ids.clear();
        self.frontier.clear();
        for op in operations {
            self.record(op);
        }
    }

    fn record(&mut self, op: Operation) {
        self.applied_ids.insert(op.id().to_string());
        let mark = self
            .frontier
            .entry(op.author_site_id().to_string())
            .or_insert(0);
        *mark = (*mark).max(op.timestamp());
        self.applied_log.push(op);
    }
}

/// Byte offset of the `char_pos`-th character, clamped to the end.
fn byte_offset(text: &str, char_pos: usize) -> usize {
    text.char_indices()
        .nth(char_pos)
        .map_or(text.len(), |(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_delete_replace() {
        let mut doc = DocumentState::with_text("hello world");

        doc.apply(Operation::insert("1", "s", 6, "big ", 1));
        assert_eq!(doc.text(), "hello big world");

        doc.apply(Operation::delete("2", "s", 0, 6, 2));
        assert_eq!(doc.text(), "big world");

        doc.apply(Operation::replace("3", "s", 0, 3, "small", 3));
        assert_eq!(doc.text(), "small world");

        assert_eq!(doc.applied_count(), 3);
    }

    #[test]
    fn test_delete_past_end_is_clamped() {
        let mut doc = DocumentState::with_text("abcdef");
        doc.apply(Operation::delete("d", "s", 4, 100, 1));
        assert_eq!(doc.text(), "abcd");

        doc.apply(Operation::delete("e", "s", 50, 3, 2));
        assert_eq!(doc.text(), "abcd");
    }

    #[test]
    fn test_log_records_clamped_range() {
        let mut doc = DocumentState::with_text("abcdef");
        doc.apply(Operation::delete("d", "s", 1, usize::MAX, 1));
        assert_eq!(doc.text(), "a");

        let logged = &doc.applied_log()[0];
        assert_eq!((logged.position(), logged.length()), (1, 5));
        assert_eq!(logged.end(), 6);
    }

    #[test]
    fn test_clamp_position_past_end() {
        let doc = DocumentState::with_text("abc");
        let op = doc.clamp(Operation::replace("r", "s", 10, 4, "x", 1));
        assert_eq!((op.position(), op.length()), (3, 0));
        assert_eq!(op.content(), "x");
    }

    #[test]
    fn test_insert_past_end_appends() {
        let mut doc = DocumentState::with_text("abc");
        doc.apply(Operation::insert("i", "s", 99, "!", 1));
        assert_eq!(doc.text(), "abc!");
    }

    #[test]
    fn test_char_offsets_with_multibyte_text() {
        let mut doc = DocumentState::with_text("añb€c");
        doc.apply(Operation::delete("d", "s", 1, 1, 1));
        assert_eq!(doc.text(), "ab€c");
        doc.apply(Operation::insert("i", "s", 3, "ü", 2));
        assert_eq!(doc.text(), "ab€üc");
        assert_eq!(doc.char_len(), 5);
    }

    #[test]
    fn test_noop_is_logged_but_changes_nothing() {
        let mut doc = DocumentState::with_text("abc");
        doc.apply(Operation::delete("n", "s", 1, 0, 1));
        assert_eq!(doc.text(), "abc");
        assert!(doc.has_applied("n"));
    }

    #[test]
    fn test_has_applied_index() {
        let mut doc = DocumentState::new();
        assert!(!doc.has_applied("x"));
        doc.apply(Operation::insert("x", "s", 0, "a", 1));
        assert!(doc.has_applied("x"));
        assert!(!doc.has_applied("y"));
    }

    #[test]
    fn test_recent_window_filters_by_timestamp() {
        let mut doc = DocumentState::new();
        doc.apply(Operation::insert("a", "s", 0, "a", 100));
        doc.apply(Operation::insert("b", "s", 1, "b", 300));
        doc.apply(Operation::insert("c", "t", 2, "c", 200));

        let ids: Vec<&str> = doc.recent_window(150).iter().map(|op| op.id()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(doc.recent_window(300).is_empty());
    }

    #[test]
    fn test_recent_ops_tail() {
        let mut doc = DocumentState::new();
        for i in 0..7u64 {
            doc.apply(Operation::insert(format!("op{i}"), "s", 0, "x", i));
        }
        let tail: Vec<&str> = doc.recent_ops(5).iter().map(|op| op.id()).collect();
        assert_eq!(tail, vec!["op2", "op3", "op4", "op5", "op6"]);
        assert_eq!(doc.recent_ops(100).len(), 7);
    }

    #[test]
    fn test_frontier_tracks_max_per_site() {
        let mut doc = DocumentState::new();
        doc.apply(Operation::insert("a", "s1", 0, "a", 10));
        doc.apply(Operation::insert("b", "s2", 0, "b", 30));
        doc.apply(Operation::insert("c", "s1", 0, "c", 20));

        let frontier = doc.frontier_excluding("s2");
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier["s1"], 20);
    }

    #[test]
    fn test_reset_replaces_everything() {
        let mut doc = DocumentState::with_text("old");
        doc.apply(Operation::insert("stale", "s", 0, "x", 1));

        let restored = vec![Operation::insert("kept", "s", 0, "new", 5)];
        doc.reset("new", restored);

        assert_eq!(doc.text(), "new");
        assert_eq!(doc.applied_count(), 1);
        assert!(doc.has_applied("kept"));
        assert!(!doc.has_applied("stale"));
    }
}
