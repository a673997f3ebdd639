//! Operational transformation against a window of recently applied edits.
//!
//! An incoming operation was authored against some earlier buffer state. Before
//! it is applied locally it is folded, in application order, through the
//! operations this site applied concurrently with it, so that its position
//! (and removed length) refer to the current buffer.
//!
//! The fold is a single sequential pass. It converges for the common cases of
//! concurrent inserts and non-overlapping edits, but it does not satisfy the
//! TP1/TP2 transformation properties in general, and an operation arriving
//! after its concurrent peers have left the window is applied untransformed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::document::DocumentState;
use crate::operation::{OpKind, Operation};

/// Which applied operations are considered for transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPolicy {
    /// Operations whose timestamp is within this many milliseconds before the
    /// incoming operation's timestamp (or later).
    Duration { millis: u64 },
    /// The last `n` applied operations.
    LastOperations(usize),
}

impl WindowPolicy {
    pub fn duration(window: Duration) -> Self {
        WindowPolicy::Duration {
            millis: window.as_millis() as u64,
        }
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        WindowPolicy::Duration { millis: 1000 }
    }
}

/// Stateless OT engine parameterized by its window policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Transformer {
    policy: WindowPolicy,
}

impl Transformer {
    pub fn new(policy: WindowPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Applied operations `op` must be transformed against: inside the policy
    /// window and not already seen by `op`'s author.
    pub fn window<'a>(&self, document: &'a DocumentState, op: &Operation) -> Vec<&'a Operation> {
        let candidates: Vec<&Operation> = match self.policy {
            WindowPolicy::Duration { millis } => {
                document.recent_window(op.timestamp().saturating_sub(millis))
            }
            WindowPolicy::LastOperations(count) => document.recent_ops(count).iter().collect(),
        };
        candidates
            .into_iter()
            .filter(|applied| !op.has_seen(applied))
            .collect()
    }

    /// Fold `op` through `window` (oldest first).
    pub fn transform<'a, I>(&self, mut op: Operation, window: I) -> Operation
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        for applied in window {
            if applied.author_site_id() == op.author_site_id() {
                continue;
            }
            transform_one(&mut op, applied);
        }
        op
    }

    /// Window selection and fold in one step.
    pub fn transform_for(&self, document: &DocumentState, op: Operation) -> Operation {
        let window = self.window(document, &op);
        self.transform(op, window)
    }
}

/// Rewrite `op` so it applies after `applied`.
fn transform_one(op: &mut Operation, applied: &Operation) {
    match applied.kind() {
        OpKind::Insert => {
            after_insert(op, applied.position(), applied.content_len(), applied.author_site_id());
        }
        OpKind::Delete => after_removal(op, applied.position(), applied.length()),
        OpKind::Replace => {
            after_removal(op, applied.position(), applied.length());
            after_insert(op, applied.position(), applied.content_len(), applied.author_site_id());
        }
    }
}

fn after_insert(op: &mut Operation, at: usize, inserted: usize, author: &str) {
    if inserted == 0 {
        return;
    }
    let lands_first = at < op.position()
        || (at == op.position()
            && match op.kind() {
                // Same offset: the lower site id goes first.
                OpKind::Insert => author < op.author_site_id(),
                OpKind::Delete | OpKind::Replace => true,
            });

    if lands_first {
        op.set_position(op.position().saturating_add(inserted));
    } else if op.kind().removes() && at < op.end() {
        // Inserted strictly inside the removed range.
        op.set_length(op.length().saturating_add(inserted));
    }
}

fn after_removal(op: &mut Operation, at: usize, removed: usize) {
    if removed == 0 {
        return;
    }
    let removed_end = at.saturating_add(removed);
    let op_start = op.position();
    let op_end = op.end();

    if removed_end <= op_start {
        op.set_position(op_start - removed);
        return;
    }

    if at < op_start {
        if op.kind().removes() {
            let overlap = removed_end.min(op_end) - op_start;
            op.set_length(op.length() - overlap);
        }
        op.set_position(at.max(op_start.saturating_sub(removed)));
        return;
    }

    if op.kind().removes() && at < op_end {
        let overlap = removed_end.min(op_end) - at;
        op.set_length(op.length() - overlap);
    }
}
