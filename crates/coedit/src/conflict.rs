/// Conflict detection for concurrent text operations
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{is_concurrent, kinds_conflict, Operation, OperationKind, ResolutionStrategy};

/// Types of conflicts that can occur between two operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Both sites inserted at the same position
    InsertInsert,

    /// One site inserted inside a range the other deleted
    InsertDelete,

    /// Both sites deleted overlapping ranges
    DeleteDelete,

    /// Both sites rewrote the same text
    UpdateUpdate,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::InsertInsert => "insert-insert",
            ConflictType::InsertDelete => "insert-delete",
            ConflictType::DeleteDelete => "delete-delete",
            ConflictType::UpdateUpdate => "update-update",
        }
    }
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    #[default]
    Low,
    Medium,
    High,
}

/// A detected conflict between two concurrent operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub id: String,
    pub operation1: Operation,
    pub operation2: Operation,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<ResolutionStrategy>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub detected_at: DateTime<Utc>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictInfo {
    pub fn new(
        operation1: Operation,
        operation2: Operation,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation1,
            operation2,
            conflict_type,
            severity,
            resolved: false,
            resolution_strategy: None,
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn mark_resolved(&mut self, strategy: ResolutionStrategy) {
        self.resolved = true;
        self.resolution_strategy = Some(strategy);
        self.resolved_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDetectionConfig {
    #[serde(default = "enabled")]
    pub detect_insert_insert: bool,
    #[serde(default = "enabled")]
    pub detect_insert_delete: bool,
    #[serde(default = "enabled")]
    pub detect_delete_delete: bool,
    #[serde(default = "enabled")]
    pub detect_update_update: bool,

    /// Conflicts below this severity are not reported
    #[serde(default)]
    pub severity_threshold: ConflictSeverity,

    #[serde(default = "enabled")]
    pub auto_resolve: bool,

    /// Distance in characters within which two inserts count as nearby
    #[serde(default = "default_nearby_window")]
    pub nearby_window: usize,
}

fn enabled() -> bool {
    true
}

fn default_nearby_window() -> usize {
    10
}

impl Default for ConflictDetectionConfig {
    fn default() -> Self {
        Self {
            detect_insert_insert: true,
            detect_insert_delete: true,
            detect_delete_delete: true,
            detect_update_update: true,
            severity_threshold: ConflictSeverity::Low,
            auto_resolve: true,
            nearby_window: default_nearby_window(),
        }
    }
}

impl ConflictDetectionConfig {
    pub fn is_enabled(&self, conflict_type: ConflictType) -> bool {
        match conflict_type {
            ConflictType::InsertInsert => self.detect_insert_insert,
            ConflictType::InsertDelete => self.detect_insert_delete,
            ConflictType::DeleteDelete => self.detect_delete_delete,
            ConflictType::UpdateUpdate => self.detect_update_update,
        }
    }
}

/// Classify the conflict between two edits, if they conflict at all
pub fn classify(a: &OperationKind, b: &OperationKind) -> Option<ConflictType> {
    use OperationKind::*;

    if !kinds_conflict(a, b) {
        return None;
    }
    match (a, b) {
        (Insert { .. }, Insert { .. }) => Some(ConflictType::InsertInsert),
        (Insert { .. }, Delete { .. }) | (Delete { .. }, Insert { .. }) => {
            Some(ConflictType::InsertDelete)
        }
        (Delete { .. }, Delete { .. }) => Some(ConflictType::DeleteDelete),
        (Update { .. }, Update { .. }) => Some(ConflictType::UpdateUpdate),
        _ => None,
    }
}

/// Severity from positional proximity or overlap
pub fn calculate_severity(
    conflict_type: ConflictType,
    a: &OperationKind,
    b: &OperationKind,
    nearby_window: usize,
) -> ConflictSeverity {
    match conflict_type {
        ConflictType::InsertInsert => {
            let distance = a.position().abs_diff(b.position());
            if distance == 0 {
                ConflictSeverity::High
            } else if distance <= nearby_window {
                ConflictSeverity::Medium
            } else {
                ConflictSeverity::Low
            }
        }
        ConflictType::InsertDelete => ConflictSeverity::Medium,
        ConflictType::DeleteDelete => {
            let overlap = a
                .end()
                .min(b.end())
                .saturating_sub(a.position().max(b.position()));
            let shorter = a.length().min(b.length());
            if shorter == 0 {
                return ConflictSeverity::Low;
            }
            let fraction = overlap as f64 / shorter as f64;
            if fraction > 0.5 {
                ConflictSeverity::High
            } else if fraction > 0.2 {
                ConflictSeverity::Medium
            } else {
                ConflictSeverity::Low
            }
        }
        ConflictType::UpdateUpdate => ConflictSeverity::High,
    }
}

/// Check a pair of operations for a reportable conflict
pub fn detect_conflict(
    a: &Operation,
    b: &Operation,
    config: &ConflictDetectionConfig,
) -> Option<ConflictInfo> {
    if a.site_id == b.site_id || !is_concurrent(a, b) {
        return None;
    }

    let conflict_type = classify(&a.kind, &b.kind)?;
    if !config.is_enabled(conflict_type) {
        return None;
    }

    let severity = calculate_severity(conflict_type, &a.kind, &b.kind, config.nearby_window);
    if severity < config.severity_threshold {
        return None;
    }

    Some(ConflictInfo::new(a.clone(), b.clone(), conflict_type, severity))
}

/// Conflicts between `op` and any other operation in `log`
pub fn detect_conflicts(
    op: &Operation,
    log: &[Operation],
    config: &ConflictDetectionConfig,
) -> Vec<ConflictInfo> {
    log.iter()
        .filter(|other| other.id != op.id)
        .filter_map(|other| detect_conflict(op, other, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SiteId, Timestamp, VersionVector};

    fn op(counter: u64, site: &str, kind: OperationKind) -> Operation {
        Operation::new(Timestamp::new(counter, site), kind, VersionVector::new())
    }

    fn ins(position: usize) -> OperationKind {
        OperationKind::Insert {
            position,
            content: "x".to_string(),
        }
    }

    fn del(position: usize, length: usize) -> OperationKind {
        OperationKind::Delete { position, length }
    }

    #[test]
    fn test_insert_insert_same_position_is_high() {
        let a = op(1, "A", ins(5));
        let b = op(1, "B", ins(5));

        let conflict = detect_conflict(&a, &b, &ConflictDetectionConfig::default()).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::InsertInsert);
        assert_eq!(conflict.severity, ConflictSeverity::High);
        assert!(!conflict.resolved);
    }

    #[test]
    fn test_same_site_or_causal_pairs_never_conflict() {
        let config = ConflictDetectionConfig::default();
        let a = op(1, "A", ins(5));
        let same_site = op(2, "A", ins(5));
        assert!(detect_conflict(&a, &same_site, &config).is_none());

        let mut seen: VersionVector = VersionVector::new();
        seen.advance(&SiteId::from("A"), 1);
        let causal = Operation::new(Timestamp::new(2, "B"), ins(5), seen);
        assert!(detect_conflict(&a, &causal, &config).is_none());
    }

    #[test]
    fn test_insert_severity_by_distance() {
        assert_eq!(
            calculate_severity(ConflictType::InsertInsert, &ins(5), &ins(12), 10),
            ConflictSeverity::Medium
        );
        assert_eq!(
            calculate_severity(ConflictType::InsertInsert, &ins(5), &ins(40), 10),
            ConflictSeverity::Low
        );
    }

    #[test]
    fn test_delete_delete_severity_by_overlap() {
        // 3 of 4 characters shared
        assert_eq!(
            calculate_severity(ConflictType::DeleteDelete, &del(0, 4), &del(1, 10), 10),
            ConflictSeverity::High
        );
        // 3 of 10
        assert_eq!(
            calculate_severity(ConflictType::DeleteDelete, &del(0, 10), &del(7, 10), 10),
            ConflictSeverity::Medium
        );
        // 1 of 10
        assert_eq!(
            calculate_severity(ConflictType::DeleteDelete, &del(0, 10), &del(9, 10), 10),
            ConflictSeverity::Low
        );
    }

    #[test]
    fn test_threshold_and_disabled_types() {
        let a = op(1, "A", del(0, 10));
        let b = op(1, "B", del(9, 10));

        let config = ConflictDetectionConfig {
            severity_threshold: ConflictSeverity::Medium,
            ..ConflictDetectionConfig::default()
        };
        assert!(detect_conflict(&a, &b, &config).is_none());

        let config = ConflictDetectionConfig {
            detect_delete_delete: false,
            ..ConflictDetectionConfig::default()
        };
        assert!(detect_conflict(&a, &b, &config).is_none());
        assert!(detect_conflict(&a, &b, &ConflictDetectionConfig::default()).is_some());
    }

    #[test]
    fn test_detect_conflicts_against_log() {
        let incoming = op(2, "B", ins(3));
        let log = vec![
            op(1, "A", del(1, 4)),
            op(2, "A", ins(9)),
            incoming.clone(),
        ];

        let conflicts = detect_conflicts(&incoming, &log, &ConflictDetectionConfig::default());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::InsertDelete);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Medium);
    }

    #[test]
    fn test_wire_shape() {
        let conflict = ConflictInfo::new(
            op(1, "A", ins(0)),
            op(1, "B", ins(0)),
            ConflictType::InsertInsert,
            ConflictSeverity::High,
        );
        let value = serde_json::to_value(&conflict).unwrap();
        assert_eq!(value["type"], "insert-insert");
        assert_eq!(value["severity"], "high");
        assert!(value.get("resolvedAt").is_none());
    }
}
