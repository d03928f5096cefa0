/// Replicated text operations
/// These operations represent edits that are synchronized across sites
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CoeditError, Result, SiteId, Timestamp, VersionVector};

/// Largest position or range end an operation may carry. Leaves headroom so
/// transform arithmetic on valid operations cannot overflow.
pub const MAX_POSITION: usize = usize::MAX / 4;

/// Unique operation identifier, derived from `(type, counter, site)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub String);

impl OperationId {
    pub fn derive(op_type: OperationType, counter: u64, site_id: &SiteId) -> Self {
        Self(format!("{}-{}-{}", op_type.as_str(), counter, site_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Delete,
    Update,
    Format,
    Move,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Delete => "delete",
            OperationType::Update => "update",
            OperationType::Format => "format",
            OperationType::Move => "move",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The edit an operation performs. Positions and lengths count characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperationKind {
    Insert {
        position: usize,
        content: String,
    },
    Delete {
        position: usize,
        length: usize,
    },
    /// Bounded replace of `[position, position + length)` with `content`
    Update {
        position: usize,
        length: usize,
        content: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        properties: Map<String, Value>,
    },
    /// Attach properties to a range without touching the text
    Format {
        position: usize,
        length: usize,
        #[serde(default)]
        properties: Map<String, Value>,
    },
    /// Cut `[position, position + length)` and re-insert it at `target`
    /// (`target` is in pre-move coordinates)
    Move {
        position: usize,
        length: usize,
        target: usize,
    },
}

impl OperationKind {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationKind::Insert { .. } => OperationType::Insert,
            OperationKind::Delete { .. } => OperationType::Delete,
            OperationKind::Update { .. } => OperationType::Update,
            OperationKind::Format { .. } => OperationType::Format,
            OperationKind::Move { .. } => OperationType::Move,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            OperationKind::Insert { position, .. }
            | OperationKind::Delete { position, .. }
            | OperationKind::Update { position, .. }
            | OperationKind::Format { position, .. }
            | OperationKind::Move { position, .. } => *position,
        }
    }

    /// Length of the range the operation covers; inserts cover their content
    pub fn length(&self) -> usize {
        match self {
            OperationKind::Insert { content, .. } => char_len(content),
            OperationKind::Delete { length, .. }
            | OperationKind::Update { length, .. }
            | OperationKind::Format { length, .. }
            | OperationKind::Move { length, .. } => *length,
        }
    }

    /// Exclusive end of the covered range
    pub fn end(&self) -> usize {
        self.position().saturating_add(self.length())
    }

    /// Structural checks that do not depend on document state
    pub fn validate(&self) -> Result<()> {
        let end = self.position().checked_add(self.length());
        let target = match self {
            OperationKind::Move { target, .. } => *target,
            _ => 0,
        };
        if end.map_or(true, |end| end > MAX_POSITION) || target > MAX_POSITION {
            return Err(CoeditError::InvalidOperation(format!(
                "range {}+{} is beyond the largest supported position {}",
                self.position(),
                self.length(),
                MAX_POSITION
            )));
        }

        match self {
            OperationKind::Insert { content, .. } if content.is_empty() => Err(
                CoeditError::InvalidOperation("insert requires non-empty content".to_string()),
            ),
            OperationKind::Delete { length: 0, .. } => Err(CoeditError::InvalidOperation(
                "delete requires a positive length".to_string(),
            )),
            OperationKind::Move {
                position,
                length,
                target,
            } if *length == 0 || (*target > *position && *target < position.saturating_add(*length)) => {
                Err(CoeditError::InvalidOperation(
                    "move requires a positive length and a target outside the moved range"
                        .to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Clamp positions and lengths into a document of `len` characters
    pub fn clamped(&self, len: usize) -> OperationKind {
        let clamp_range = |position: usize, length: usize| {
            let position = position.min(len);
            (position, length.min(len - position))
        };

        match self {
            OperationKind::Insert { position, content } => OperationKind::Insert {
                position: (*position).min(len),
                content: content.clone(),
            },
            OperationKind::Delete { position, length } => {
                let (position, length) = clamp_range(*position, *length);
                OperationKind::Delete { position, length }
            }
            OperationKind::Update {
                position,
                length,
                content,
                properties,
            } => {
                let (position, length) = clamp_range(*position, *length);
                OperationKind::Update {
                    position,
                    length,
                    content: content.clone(),
                    properties: properties.clone(),
                }
            }
            OperationKind::Format {
                position,
                length,
                properties,
            } => {
                let (position, length) = clamp_range(*position, *length);
                OperationKind::Format {
                    position,
                    length,
                    properties: properties.clone(),
                }
            }
            OperationKind::Move {
                position,
                length,
                target,
            } => {
                let (position, length) = clamp_range(*position, *length);
                OperationKind::Move {
                    position,
                    length,
                    target: (*target).min(len),
                }
            }
        }
    }

    /// Whether applying this operation leaves the text unchanged
    pub fn is_noop(&self) -> bool {
        match self {
            OperationKind::Insert { content, .. } => content.is_empty(),
            OperationKind::Delete { length, .. } => *length == 0,
            OperationKind::Update {
                length, content, ..
            } => *length == 0 && content.is_empty(),
            OperationKind::Format { .. } => true,
            OperationKind::Move {
                position,
                length,
                target,
            } => *length == 0 || (*target >= *position && *target <= position.saturating_add(*length)),
        }
    }
}

/// Text operation that can be replicated across sites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Unique operation ID
    pub id: OperationId,

    /// Lamport timestamp for ordering
    pub timestamp: Timestamp,

    /// Site that created this operation
    pub site_id: SiteId,

    /// The actual edit
    #[serde(flatten)]
    pub kind: OperationKind,

    /// Version vector of the issuing document when the operation was created
    #[serde(default)]
    pub context: VersionVector,

    /// Operation this one was derived from, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OperationId>,
}

impl Operation {
    pub fn new(timestamp: Timestamp, kind: OperationKind, context: VersionVector) -> Self {
        Self {
            id: OperationId::derive(kind.op_type(), timestamp.counter, &timestamp.site_id),
            site_id: timestamp.site_id.clone(),
            timestamp,
            kind,
            context,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: OperationId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Decode an operation from untyped JSON, mapping any shape error to a
    /// validation error
    pub fn from_value(value: Value) -> Result<Self> {
        let op: Operation = serde_json::from_value(value)
            .map_err(|e| CoeditError::InvalidOperation(e.to_string()))?;
        op.validate()?;
        Ok(op)
    }

    pub fn op_type(&self) -> OperationType {
        self.kind.op_type()
    }

    pub fn position(&self) -> usize {
        self.kind.position()
    }

    pub fn length(&self) -> usize {
        self.kind.length()
    }

    pub fn end(&self) -> usize {
        self.kind.end()
    }

    /// Reject operations whose identity or payload is malformed
    pub fn validate(&self) -> Result<()> {
        if self.site_id.as_str().is_empty() {
            return Err(CoeditError::InvalidOperation(format!(
                "operation {} has an empty site id",
                self.id
            )));
        }
        if self.timestamp.site_id != self.site_id {
            return Err(CoeditError::InvalidOperation(format!(
                "operation {} timestamp site {} does not match site {}",
                self.id, self.timestamp.site_id, self.site_id
            )));
        }
        if self.timestamp.counter == 0 {
            return Err(CoeditError::InvalidOperation(format!(
                "operation {} has a zero counter",
                self.id
            )));
        }
        let expected = OperationId::derive(self.op_type(), self.timestamp.counter, &self.site_id);
        if self.id != expected {
            return Err(CoeditError::InvalidOperation(format!(
                "operation id {} does not match {}",
                self.id, expected
            )));
        }
        self.kind.validate()
    }
}

/// Number of characters in `s`
pub fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn byte_offset(s: &str, char_index: usize) -> usize {
    s.char_indices()
        .nth(char_index)
        .map(|(offset, _)| offset)
        .unwrap_or(s.len())
}

/// Apply an edit to `content`, failing if it addresses text past the end
pub fn apply_to_string(content: &str, kind: &OperationKind) -> Result<String> {
    let len = char_len(content);
    if kind.end() > len && !matches!(kind, OperationKind::Insert { .. }) {
        return Err(CoeditError::OutOfBounds {
            position: kind.end(),
            length: len,
        });
    }
    let check = |end: usize| {
        if end > len {
            Err(CoeditError::OutOfBounds {
                position: end,
                length: len,
            })
        } else {
            Ok(())
        }
    };

    match kind {
        OperationKind::Insert { position, content: text } => {
            check(*position)?;
            let at = byte_offset(content, *position);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            Ok(out)
        }
        OperationKind::Delete { position, length } => {
            check(position + length)?;
            let start = byte_offset(content, *position);
            let end = byte_offset(content, position + length);
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            Ok(out)
        }
        OperationKind::Update {
            position,
            length,
            content: text,
            ..
        } => {
            check(position + length)?;
            let start = byte_offset(content, *position);
            let end = byte_offset(content, position + length);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..start]);
            out.push_str(text);
            out.push_str(&content[end..]);
            Ok(out)
        }
        OperationKind::Format { position, length, .. } => {
            check(position + length)?;
            Ok(content.to_string())
        }
        OperationKind::Move {
            position,
            length,
            target,
        } => {
            check(position + length)?;
            check(*target)?;
            if kind.is_noop() {
                return Ok(content.to_string());
            }
            let start = byte_offset(content, *position);
            let end = byte_offset(content, position + length);
            let moved = &content[start..end];
            let mut rest = String::with_capacity(content.len());
            rest.push_str(&content[..start]);
            rest.push_str(&content[end..]);
            let target = if *target > *position {
                target - length
            } else {
                *target
            };
            let at = byte_offset(&rest, target);
            let mut out = String::with_capacity(content.len());
            out.push_str(&rest[..at]);
            out.push_str(moved);
            out.push_str(&rest[at..]);
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(counter: u64, site: &str, position: usize, content: &str) -> Operation {
        Operation::new(
            Timestamp::new(counter, site),
            OperationKind::Insert {
                position,
                content: content.to_string(),
            },
            VersionVector::new(),
        )
    }

    #[test]
    fn test_operation_id_is_derived() {
        let op = insert(7, "site-a", 0, "x");
        assert_eq!(op.id.as_str(), "insert-7-site-a");
        assert!(op.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_malformed() {
        let mut op = insert(1, "A", 0, "");
        assert!(matches!(
            op.validate(),
            Err(CoeditError::InvalidOperation(_))
        ));

        op = insert(1, "A", 0, "x");
        op.id = OperationId("forged".to_string());
        assert!(op.validate().is_err());

        let delete = Operation::new(
            Timestamp::new(2, "A"),
            OperationKind::Delete {
                position: 0,
                length: 0,
            },
            VersionVector::new(),
        );
        assert!(delete.validate().is_err());
    }

    #[test]
    fn test_from_value_rejects_unknown_type() {
        let value = serde_json::json!({
            "id": "split-1-A",
            "type": "split",
            "timestamp": {"counter": 1, "siteId": "A"},
            "siteId": "A",
            "position": 0
        });
        assert!(Operation::from_value(value).is_err());

        let missing_content = serde_json::json!({
            "id": "insert-1-A",
            "type": "insert",
            "timestamp": {"counter": 1, "siteId": "A"},
            "siteId": "A",
            "position": 0
        });
        assert!(Operation::from_value(missing_content).is_err());
    }

    #[test]
    fn test_wire_shape() {
        let op = insert(1, "A", 3, "hi");
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "insert");
        assert_eq!(value["position"], 3);
        assert_eq!(value["content"], "hi");
        assert_eq!(value["siteId"], "A");

        let back = Operation::from_value(value).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_apply_insert_delete_update() {
        let s = apply_to_string(
            "hello",
            &OperationKind::Insert {
                position: 5,
                content: " world".to_string(),
            },
        )
        .unwrap();
        assert_eq!(s, "hello world");

        let s = apply_to_string(
            &s,
            &OperationKind::Delete {
                position: 0,
                length: 6,
            },
        )
        .unwrap();
        assert_eq!(s, "world");

        let s = apply_to_string(
            &s,
            &OperationKind::Update {
                position: 0,
                length: 1,
                content: "W".to_string(),
                properties: Map::new(),
            },
        )
        .unwrap();
        assert_eq!(s, "World");
    }

    #[test]
    fn test_apply_counts_characters_not_bytes() {
        let s = apply_to_string(
            "héllo",
            &OperationKind::Delete {
                position: 1,
                length: 1,
            },
        )
        .unwrap();
        assert_eq!(s, "hllo");
    }

    #[test]
    fn test_apply_out_of_bounds() {
        let result = apply_to_string(
            "abc",
            &OperationKind::Delete {
                position: 2,
                length: 5,
            },
        );
        assert!(matches!(result, Err(CoeditError::OutOfBounds { .. })));
    }

    #[test]
    fn test_overflowing_ranges_rejected() {
        let huge_move = OperationKind::Move {
            position: 1,
            length: usize::MAX,
            target: 5,
        };
        assert!(matches!(
            huge_move.validate(),
            Err(CoeditError::InvalidOperation(_))
        ));
        assert_eq!(huge_move.end(), usize::MAX);
        assert!(apply_to_string("abcdef", &huge_move).is_err());

        let far_delete = OperationKind::Delete {
            position: MAX_POSITION,
            length: 1,
        };
        assert!(far_delete.validate().is_err());

        let far_target = OperationKind::Move {
            position: 0,
            length: 1,
            target: usize::MAX,
        };
        assert!(far_target.validate().is_err());
    }

    #[test]
    fn test_apply_move() {
        let forward = OperationKind::Move {
            position: 0,
            length: 2,
            target: 5,
        };
        assert_eq!(apply_to_string("abcdef", &forward).unwrap(), "cdeabf");

        let backward = OperationKind::Move {
            position: 4,
            length: 2,
            target: 1,
        };
        assert_eq!(apply_to_string("abcdef", &backward).unwrap(), "aefbcd");
    }

    #[test]
    fn test_clamped_stays_in_bounds() {
        let kind = OperationKind::Delete {
            position: 8,
            length: 4,
        }
        .clamped(5);
        assert_eq!(
            kind,
            OperationKind::Delete {
                position: 5,
                length: 0
            }
        );
        assert!(kind.is_noop());
    }
}
