//! Operational transform for text operations.
//!
//! `transform(op, other)` re-expresses `op` in a frame where `other` has
//! already been applied. Only causally concurrent operations from different
//! sites are transformed; everything else is already ordered.

use std::cmp::Ordering;

use crate::{Operation, OperationKind, Timestamp};

/// Two operations are concurrent when they come from different sites and
/// neither was generated with the other already applied.
pub fn is_concurrent(a: &Operation, b: &Operation) -> bool {
    a.site_id != b.site_id && !a.context.includes(&b.timestamp) && !b.context.includes(&a.timestamp)
}

/// Re-express `op` in the causal frame that already includes `other`
pub fn transform(op: &Operation, other: &Operation) -> Operation {
    if op.site_id == other.site_id || !is_concurrent(op, other) {
        return op.clone();
    }

    let mut transformed = op.clone();
    transformed.kind = transform_kind(&op.kind, &op.timestamp, &other.kind, &other.timestamp);
    transformed
}

/// Position-level transform of one edit against another.
///
/// The timestamps only break ties between inserts at the same position:
/// the earlier operation keeps its place, the later one shifts right.
pub fn transform_kind(
    op: &OperationKind,
    op_ts: &Timestamp,
    other: &OperationKind,
    other_ts: &Timestamp,
) -> OperationKind {
    let later = op_ts.compare(other_ts) == Ordering::Greater;
    effects_of(other)
        .into_iter()
        .fold(op.clone(), |kind, effect| apply_effect(kind, effect, later))
}

/// How an operation moves the characters around it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    /// `count` characters inserted at `at`
    Insert { at: usize, count: usize },
    /// `[at, at + len)` removed
    Remove { at: usize, len: usize },
    /// `[at, at + len)` replaced by `count` characters
    Replace { at: usize, len: usize, count: usize },
}

fn effects_of(kind: &OperationKind) -> Vec<Effect> {
    match kind {
        OperationKind::Insert { position, content } => vec![Effect::Insert {
            at: *position,
            count: crate::char_len(content),
        }],
        OperationKind::Delete { position, length } => vec![Effect::Remove {
            at: *position,
            len: *length,
        }],
        OperationKind::Update {
            position,
            length,
            content,
            ..
        } => {
            let count = crate::char_len(content);
            if *length == 0 {
                vec![Effect::Insert {
                    at: *position,
                    count,
                }]
            } else {
                vec![Effect::Replace {
                    at: *position,
                    len: *length,
                    count,
                }]
            }
        }
        OperationKind::Format { .. } => Vec::new(),
        OperationKind::Move { .. } if kind.is_noop() => Vec::new(),
        OperationKind::Move {
            position,
            length,
            target,
        } => {
            let at = if *target > *position {
                target - length
            } else {
                *target
            };
            vec![
                Effect::Remove {
                    at: *position,
                    len: *length,
                },
                Effect::Insert { at, count: *length },
            ]
        }
    }
}

/// Shift an insertion point
fn shift_point(pos: usize, effect: Effect, later: bool) -> usize {
    match effect {
        Effect::Insert { at, count } => {
            if pos > at || (pos == at && later) {
                pos + count
            } else {
                pos
            }
        }
        Effect::Remove { at, len } => {
            if pos <= at {
                pos
            } else if pos >= at + len {
                pos - len
            } else {
                // Inside the removed range: collapse to its start
                at
            }
        }
        Effect::Replace { at, len, count } => {
            if pos >= at + len {
                pos - len + count
            } else {
                pos
            }
        }
    }
}

/// Shift a covered range `[pos, pos + len)`
fn shift_range(pos: usize, len: usize, effect: Effect) -> (usize, usize) {
    match effect {
        Effect::Insert { at, count } => {
            if pos + len <= at {
                (pos, len)
            } else if pos >= at {
                (pos + count, len)
            } else {
                // Insert lands inside the range: grow to swallow it
                (pos, len + count)
            }
        }
        Effect::Remove { at, len: removed } => {
            let end = pos + len;
            let removed_end = at + removed;
            if end <= at {
                (pos, len)
            } else if pos >= removed_end {
                (pos - removed, len)
            } else {
                // Overlap shrinks the range rather than splitting it
                let overlap = end.min(removed_end) - pos.max(at);
                (pos.min(at), len - overlap)
            }
        }
        Effect::Replace {
            at,
            len: replaced,
            count,
        } => {
            if pos >= at + replaced {
                (pos - replaced + count, len)
            } else {
                // Overlap with a replaced range is not resolved precisely
                (pos, len)
            }
        }
    }
}

fn apply_effect(kind: OperationKind, effect: Effect, later: bool) -> OperationKind {
    match kind {
        OperationKind::Insert { position, content } => OperationKind::Insert {
            position: shift_point(position, effect, later),
            content,
        },
        OperationKind::Delete { position, length } => {
            let (position, length) = shift_range(position, length, effect);
            OperationKind::Delete { position, length }
        }
        OperationKind::Update {
            position,
            length,
            content,
            properties,
        } => OperationKind::Update {
            position: shift_point(position, effect, later),
            length,
            content,
            properties,
        },
        OperationKind::Format {
            position,
            length,
            properties,
        } => {
            let (position, length) = shift_range(position, length, effect);
            OperationKind::Format {
                position,
                length,
                properties,
            }
        }
        OperationKind::Move {
            position,
            length,
            target,
        } => {
            let (position, length) = shift_range(position, length, effect);
            OperationKind::Move {
                position,
                length,
                target: shift_point(target, effect, later),
            }
        }
    }
}

/// Whether two operations touch the same text in a way that needs reporting.
///
/// Same-site pairs never conflict.
pub fn operations_conflict(a: &Operation, b: &Operation) -> bool {
    if a.site_id == b.site_id {
        return false;
    }
    kinds_conflict(&a.kind, &b.kind)
}

pub(crate) fn kinds_conflict(a: &OperationKind, b: &OperationKind) -> bool {
    use OperationKind::*;

    let inside = |point: usize, start: usize, end: usize| point > start && point < end;
    let overlaps = |a: &OperationKind, b: &OperationKind| a.position() < b.end() && b.position() < a.end();

    match (a, b) {
        (Insert { position: p1, .. }, Insert { position: p2, .. }) => p1 == p2,
        (Insert { position, .. }, Delete { .. }) => inside(*position, b.position(), b.end()),
        (Delete { .. }, Insert { position, .. }) => inside(*position, a.position(), a.end()),
        (Delete { .. }, Delete { .. }) => overlaps(a, b),
        (Update { .. }, Update { .. }) => a.position() == b.position() || overlaps(a, b),
        _ => false,
    }
}
