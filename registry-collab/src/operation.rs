//! Text edit operations exchanged between editing sites.
//!
//! An [`Operation`] is the atomic unit of change. Its identity (`id`), kind,
//! content and author are fixed once the id is assigned; only the position and
//! removed length may be rewritten by the transformer before local application.
//!
//! Offsets and lengths are counted in `char`s, not bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Kind of text edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
    Replace,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Delete => "delete",
            OpKind::Replace => "replace",
        }
    }

    /// Whether this kind removes characters from the buffer.
    pub fn removes(&self) -> bool {
        matches!(self, OpKind::Delete | OpKind::Replace)
    }
}

/// Rejection reasons for edits coming from the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("operation is missing its type")]
    MissingKind,
    #[error("operation is missing its position")]
    MissingPosition,
    #[error("operation id must not be empty")]
    EmptyId,
    #[error("operation id {0} was already applied")]
    DuplicateId(String),
}

/// A single text edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    id: String,
    #[serde(rename = "type")]
    kind: OpKind,
    position: usize,
    length: usize,
    content: String,
    timestamp: u64,
    author_site_id: String,
    /// Highest timestamp applied from each foreign site when this operation
    /// was authored. Window entries at or below these marks are causally
    /// prior and are not transformed against.
    #[serde(default)]
    seen: BTreeMap<String, u64>,
}

impl Operation {
    /// Build an operation, normalizing fields the kind does not use.
    pub fn new(
        id: impl Into<String>,
        kind: OpKind,
        author_site_id: impl Into<String>,
        position: usize,
        length: usize,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        let (length, content) = match kind {
            OpKind::Insert => (0, content.into()),
            OpKind::Delete => (length, String::new()),
            OpKind::Replace => (length, content.into()),
        };
        Self {
            id: id.into(),
            kind,
            position,
            length,
            content,
            timestamp,
            author_site_id: author_site_id.into(),
            seen: BTreeMap::new(),
        }
    }

    pub fn insert(
        id: impl Into<String>,
        author_site_id: impl Into<String>,
        position: usize,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self::new(id, OpKind::Insert, author_site_id, position, 0, content, timestamp)
    }

    pub fn delete(
        id: impl Into<String>,
        author_site_id: impl Into<String>,
        position: usize,
        length: usize,
        timestamp: u64,
    ) -> Self {
        Self::new(id, OpKind::Delete, author_site_id, position, length, "", timestamp)
    }

    pub fn replace(
        id: impl Into<String>,
        author_site_id: impl Into<String>,
        position: usize,
        length: usize,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self::new(id, OpKind::Replace, author_site_id, position, length, content, timestamp)
    }

    /// Generate a globally unique id: `{site}_{timestamp}_{random}`.
    pub fn generate_id(site_id: &str, timestamp: u64) -> String {
        let random = Uuid::new_v4().simple().to_string();
        format!("{site_id}_{timestamp}_{}", &random[..9])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Characters removed. Always 0 for inserts.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Inserted length in characters.
    pub fn content_len(&self) -> usize {
        self.content.chars().count()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn author_site_id(&self) -> &str {
        &self.author_site_id
    }

    /// End of the removed range (exclusive).
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.length)
    }

    pub fn seen(&self) -> &BTreeMap<String, u64> {
        &self.seen
    }

    /// Whether the author had already applied `other` when creating `self`.
    ///
    /// Operations from the same site are always prior (per-site FIFO).
    pub fn has_seen(&self, other: &Operation) -> bool {
        if other.author_site_id == self.author_site_id {
            return true;
        }
        self.seen
            .get(&other.author_site_id)
            .is_some_and(|mark| other.timestamp <= *mark)
    }

    /// An operation that removes nothing and inserts nothing.
    pub fn is_noop(&self) -> bool {
        self.length == 0 && self.content.is_empty()
    }

    /// Half-open range intersection. Inserts never overlap by range.
    pub fn overlaps(&self, other: &Operation) -> bool {
        overlaps(self, other)
    }

    pub(crate) fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    pub(crate) fn set_length(&mut self, length: usize) {
        self.length = length;
    }

    pub(crate) fn set_seen(&mut self, seen: BTreeMap<String, u64>) {
        self.seen = seen;
    }
}

/// True iff `[a.position, a.end())` and `[b.position, b.end())` intersect.
pub fn overlaps(a: &Operation, b: &Operation) -> bool {
    if a.length == 0 || b.length == 0 {
        return false;
    }
    a.position < b.end() && b.position < a.end()
}

/// Edit request as it arrives from the UI layer, before validation.
///
/// `type` and `position` are mandatory; `id` and `timestamp` are assigned by the
/// session when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEdit {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<OpKind>,
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub length: usize,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

impl LocalEdit {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self {
            kind: Some(OpKind::Insert),
            position: Some(position),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            kind: Some(OpKind::Delete),
            position: Some(position),
            length,
            ..Self::default()
        }
    }

    pub fn replace(position: usize, length: usize, content: impl Into<String>) -> Self {
        Self {
            kind: Some(OpKind::Replace),
            position: Some(position),
            length,
            content: content.into(),
            ..Self::default()
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Parse an edit from the UI's JSON shape.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Check the mandatory fields without consuming the edit.
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.kind.is_none() {
            return Err(OperationError::MissingKind);
        }
        if self.position.is_none() {
            return Err(OperationError::MissingPosition);
        }
        if matches!(self.id.as_deref(), Some("")) {
            return Err(OperationError::EmptyId);
        }
        Ok(())
    }

    /// Validate, then build the operation, generating an id if none was given.
    pub fn into_operation(self, site_id: &str, timestamp: u64) -> Result<Operation, OperationError> {
        self.validate()?;
        let kind = self.kind.ok_or(OperationError::MissingKind)?;
        let position = self.position.ok_or(OperationError::MissingPosition)?;
        let timestamp = self.timestamp.unwrap_or(timestamp);
        let id = self
            .id
            .unwrap_or_else(|| Operation::generate_id(site_id, timestamp));
        Ok(Operation::new(
            id,
            kind,
            site_id,
            position,
            self.length,
            self.content,
            timestamp,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_shape() {
        let id = Operation::generate_id("site-a", 1_700_000_000_000);
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "site-a");
        assert_eq!(parts[1], "1700000000000");
        assert_eq!(parts[2].len(), 9);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = Operation::generate_id("s", 1);
        let b = Operation::generate_id("s", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constructors_normalize_unused_fields() {
        let ins = Operation::new("i", OpKind::Insert, "s", 3, 7, "abc", 1);
        assert_eq!(ins.length(), 0);
        assert_eq!(ins.content(), "abc");

        let del = Operation::new("d", OpKind::Delete, "s", 3, 2, "ignored", 1);
        assert_eq!(del.length(), 2);
        assert!(del.content().is_empty());
    }

    #[test]
    fn test_overlaps_half_open() {
        let a = Operation::delete("a", "s1", 0, 5, 1);
        let b = Operation::delete("b", "s2", 4, 2, 1);
        let c = Operation::delete("c", "s2", 5, 2, 1);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_inserts_never_overlap_by_range() {
        let a = Operation::insert("a", "s1", 2, "x", 1);
        let b = Operation::insert("b", "s2", 2, "y", 1);
        let d = Operation::delete("d", "s3", 0, 10, 1);
        assert!(!overlaps(&a, &b));
        assert!(!overlaps(&a, &d));
    }

    #[test]
    fn test_noop_detection() {
        assert!(Operation::delete("d", "s", 4, 0, 1).is_noop());
        assert!(Operation::insert("i", "s", 4, "", 1).is_noop());
        assert!(!Operation::replace("r", "s", 4, 0, "x", 1).is_noop());
    }

    #[test]
    fn test_content_len_counts_chars() {
        let op = Operation::insert("i", "s", 0, "héllo", 1);
        assert_eq!(op.content_len(), 5);
    }

    #[test]
    fn test_has_seen_uses_marks() {
        let earlier = Operation::insert("a", "site-1", 0, "x", 100);
        let later = Operation::insert("b", "site-1", 0, "y", 200);
        let mut op = Operation::insert("c", "site-2", 0, "z", 250);
        op.set_seen(BTreeMap::from([("site-1".to_string(), 150)]));

        assert!(op.has_seen(&earlier));
        assert!(!op.has_seen(&later));

        let own = Operation::insert("d", "site-2", 0, "w", 300);
        assert!(op.has_seen(&own));
    }

    #[test]
    fn test_local_edit_rejects_missing_type() {
        let edit = LocalEdit {
            position: Some(0),
            ..LocalEdit::default()
        };
        assert_eq!(
            edit.into_operation("s", 1).unwrap_err(),
            OperationError::MissingKind
        );
    }

    #[test]
    fn test_local_edit_rejects_missing_position() {
        let edit = LocalEdit {
            kind: Some(OpKind::Insert),
            content: "x".into(),
            ..LocalEdit::default()
        };
        assert_eq!(edit.validate().unwrap_err(), OperationError::MissingPosition);
    }

    #[test]
    fn test_local_edit_keeps_given_id_and_timestamp() {
        let op = LocalEdit::replace(1, 2, "zz")
            .with_id("fixed")
            .with_timestamp(42)
            .into_operation("s", 99)
            .unwrap();
        assert_eq!(op.id(), "fixed");
        assert_eq!(op.timestamp(), 42);
        assert_eq!(op.kind(), OpKind::Replace);
        assert_eq!(op.author_site_id(), "s");
    }

    #[test]
    fn test_local_edit_from_json() {
        let edit = LocalEdit::from_json(r#"{"type":"delete","position":3,"length":2}"#).unwrap();
        let op = edit.into_operation("site-9", 10).unwrap();
        assert_eq!(op.kind(), OpKind::Delete);
        assert_eq!(op.position(), 3);
        assert_eq!(op.length(), 2);
        assert!(op.id().starts_with("site-9_10_"));

        let malformed = LocalEdit::from_json(r#"{"content":"x"}"#).unwrap();
        assert!(malformed.validate().is_err());
    }
}
