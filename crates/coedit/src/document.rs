/// Replicated document state: operation log, derived text and version vector
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{
    apply_to_string, char_len, is_concurrent, transform_kind, CoeditError, Operation,
    OperationId, OperationKind, Result, SiteId, Timestamp, VersionVector,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    pub created_by: SiteId,
    pub last_modified_by: SiteId,
}

impl DocumentMetadata {
    fn new(created_by: SiteId) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            last_modified_by: created_by.clone(),
            created_by,
        }
    }
}

/// Result of applying one operation
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The operation was new. `effective` is the transformed form that was
    /// applied to the text; `replayed` counts later log entries re-derived
    /// because the operation sorted before them.
    Applied {
        effective: OperationKind,
        replayed: usize,
    },
    /// Already reflected in the document
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Collaborative text document.
///
/// The log holds every retained operation in `(counter, siteId)` order
/// alongside the effective form each one was applied with. `content` is
/// always the fold of those effective forms over `base`, where `base` is the
/// seed text plus whatever history compaction has folded in.
#[derive(Debug, Clone)]
pub struct Document {
    id: String,
    base: String,
    content: String,
    content_len: usize,
    operations: Vec<Operation>,
    effective: Vec<OperationKind>,
    index: HashMap<OperationId, usize>,
    version_vector: VersionVector,
    compacted_through: Option<Timestamp>,
    metadata: DocumentMetadata,
}

impl Document {
    pub fn new(id: impl Into<String>, created_by: SiteId) -> Self {
        Self::with_content(id, String::new(), created_by)
    }

    /// Create a document whose text starts as `seed`
    pub fn with_content(id: impl Into<String>, seed: impl Into<String>, created_by: SiteId) -> Self {
        let seed = seed.into();
        Self {
            id: id.into(),
            content_len: char_len(&seed),
            content: seed.clone(),
            base: seed,
            operations: Vec::new(),
            effective: Vec::new(),
            index: HashMap::new(),
            version_vector: VersionVector::new(),
            compacted_through: None,
            metadata: DocumentMetadata::new(created_by),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Length of the text in characters
    pub fn len(&self) -> usize {
        self.content_len
    }

    pub fn is_empty(&self) -> bool {
        self.content_len == 0
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Effective (transformed) form of each logged operation, in log order
    pub fn effective_operations(&self) -> &[OperationKind] {
        &self.effective
    }

    pub fn version_vector(&self) -> &VersionVector {
        &self.version_vector
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn compacted_through(&self) -> Option<&Timestamp> {
        self.compacted_through.as_ref()
    }

    pub fn get_operation(&self, id: &OperationId) -> Option<&Operation> {
        self.index.get(id).and_then(|&idx| self.operations.get(idx))
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.index.contains_key(id)
    }

    /// Whether `op` is already reflected here, by id or by version vector
    pub fn is_duplicate(&self, op: &Operation) -> bool {
        self.index.contains_key(&op.id) || self.version_vector.includes(&op.timestamp)
    }

    /// Context entries of `op` not yet covered by our version vector
    pub fn missing_dependencies(&self, op: &Operation) -> Vec<(SiteId, u64)> {
        op.context.missing_from(&self.version_vector)
    }

    /// Apply a local or remote operation.
    ///
    /// Malformed operations and operations with unmet causal dependencies
    /// are rejected without touching the document. Replaying an operation
    /// that is already present is a no-op.
    pub fn apply_operation(&mut self, op: Operation) -> Result<ApplyOutcome> {
        op.validate()?;

        if self.is_duplicate(&op) {
            debug!(op = %op.id, "operation already applied");
            return Ok(ApplyOutcome::Duplicate);
        }

        let missing = self.missing_dependencies(&op);
        if !missing.is_empty() {
            let missing = missing
                .iter()
                .map(|(site, counter)| format!("{}@{}", counter, site))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(CoeditError::MissingDependencies {
                operation: op.id.to_string(),
                missing,
            });
        }

        let idx = self
            .operations
            .partition_point(|existing| existing.timestamp < op.timestamp);

        if idx == 0 && self.compacted_through.is_some() && !self.operations.is_empty() {
            warn!(
                op = %op.id,
                "operation predates compacted history; applying at the oldest retained position"
            );
        }

        let site = op.site_id.clone();
        let counter = op.timestamp.counter;

        let mut sequence = Vec::with_capacity(self.operations.len() - idx + 1);
        sequence.push(op);
        sequence.extend(self.operations[idx..].iter().cloned());

        // Everything before `idx` is unchanged; replay from there
        let mut content = if idx == self.operations.len() {
            self.content.clone()
        } else {
            fold(&self.base, &self.effective[..idx])?
        };

        let mut suffix: Vec<OperationKind> = Vec::with_capacity(sequence.len());
        for (k, current) in sequence.iter().enumerate() {
            let earlier = self.operations[..idx]
                .iter()
                .zip(self.effective[..idx].iter())
                .chain(sequence[..k].iter().zip(suffix.iter()));
            let kind = effective_form(current, earlier, char_len(&content));
            content = apply_to_string(&content, &kind)?;
            suffix.push(kind);
        }

        let effective = suffix[0].clone();
        let replayed = sequence.len() - 1;

        self.operations.truncate(idx);
        self.operations.extend(sequence);
        self.effective.truncate(idx);
        self.effective.extend(suffix);
        self.reindex_from(idx);

        self.content_len = char_len(&content);
        self.content = content;
        self.version_vector.advance(&site, counter);
        self.metadata.updated_at = Utc::now();
        self.metadata.last_modified_by = site;

        Ok(ApplyOutcome::Applied {
            effective,
            replayed,
        })
    }

    /// Apply every operation of `other` that we lack, then fold in its
    /// version vector.
    ///
    /// Operations whose dependencies are missing on both sides are skipped,
    /// and their sites are left out of the vector union so they can still be
    /// delivered later.
    pub fn merge(&mut self, other: &Document) -> Result<MergeReport> {
        let mut pending: Vec<Operation> = other
            .operations
            .iter()
            .filter(|op| !self.is_duplicate(op))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        let mut report = MergeReport::default();
        loop {
            let mut progressed = false;
            let mut remaining = Vec::new();

            for op in pending {
                match self.apply_operation(op.clone()) {
                    Ok(ApplyOutcome::Applied { .. }) => {
                        report.applied += 1;
                        progressed = true;
                    }
                    Ok(ApplyOutcome::Duplicate) => {}
                    Err(CoeditError::MissingDependencies { .. }) => remaining.push(op),
                    Err(e) => {
                        warn!(op = %op.id, error = %e, "skipping operation during merge");
                        report.skipped += 1;
                    }
                }
            }

            pending = remaining;
            if !progressed || pending.is_empty() {
                break;
            }
        }

        report.skipped += pending.len();
        for (site, &counter) in other.version_vector.iter() {
            if pending.iter().all(|op| &op.site_id != site) {
                self.version_vector.advance(site, counter);
            }
        }

        Ok(report)
    }

    /// Operations a peer with `remote` version vector has not seen, in log order
    pub fn missing_operations(&self, remote: &VersionVector) -> Vec<Operation> {
        self.operations
            .iter()
            .filter(|op| op.timestamp.counter > remote.get(&op.site_id))
            .cloned()
            .collect()
    }

    /// Keep only the newest `max_ops` log entries, folding the rest into the
    /// base text. Returns how many entries were evicted.
    ///
    /// `content` is preserved. Queries for states inside the folded prefix
    /// are no longer exact.
    pub fn compress_history(&mut self, max_ops: usize) -> Result<usize> {
        if self.operations.len() <= max_ops {
            return Ok(0);
        }

        let evict = self.operations.len() - max_ops;
        let base = fold(&self.base, &self.effective[..evict])?;

        self.compacted_through = self.operations.get(evict - 1).map(|op| op.timestamp.clone());
        self.base = base;
        self.operations.drain(..evict);
        self.effective.drain(..evict);
        self.index.clear();
        self.reindex_from(0);

        debug!(document = %self.id, evicted = evict, retained = max_ops, "compressed history");
        Ok(evict)
    }

    /// Text as it stood once every retained operation up to `timestamp` was applied
    pub fn content_at(&self, timestamp: &Timestamp) -> Result<String> {
        let upto = self
            .operations
            .partition_point(|op| op.timestamp <= *timestamp);
        fold(&self.base, &self.effective[..upto])
    }

    /// Re-derive the text from the log and compare with the cached content
    pub fn verify_integrity(&self) -> bool {
        fold(&self.base, &self.effective)
            .map(|derived| derived == self.content)
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            id: self.id.clone(),
            base: self.base.clone(),
            content: self.content.clone(),
            operations: self.operations.clone(),
            effective: self.effective.clone(),
            version_vector: self.version_vector.clone(),
            compacted_through: self.compacted_through.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuild a document from a snapshot, checking that its parts agree
    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Result<Self> {
        if snapshot.operations.len() != snapshot.effective.len() {
            return Err(CoeditError::InvalidState(format!(
                "{} operations but {} effective forms",
                snapshot.operations.len(),
                snapshot.effective.len()
            )));
        }
        if snapshot
            .operations
            .windows(2)
            .any(|pair| pair[0].timestamp >= pair[1].timestamp)
        {
            return Err(CoeditError::InvalidState(
                "operation log is not in timestamp order".to_string(),
            ));
        }
        for op in &snapshot.operations {
            op.validate()?;
            if !snapshot.version_vector.includes(&op.timestamp) {
                return Err(CoeditError::InvalidState(format!(
                    "operation {} is not covered by the version vector",
                    op.id
                )));
            }
        }
        if fold(&snapshot.base, &snapshot.effective)? != snapshot.content {
            return Err(CoeditError::InvalidState(
                "content does not match the operation log".to_string(),
            ));
        }

        let mut document = Self {
            id: snapshot.id,
            content_len: char_len(&snapshot.content),
            base: snapshot.base,
            content: snapshot.content,
            operations: snapshot.operations,
            effective: snapshot.effective,
            index: HashMap::new(),
            version_vector: snapshot.version_vector,
            compacted_through: snapshot.compacted_through,
            metadata: snapshot.metadata,
        };
        document.reindex_from(0);
        Ok(document)
    }

    fn reindex_from(&mut self, start: usize) {
        for (idx, op) in self.operations.iter().enumerate().skip(start) {
            self.index.insert(op.id.clone(), idx);
        }
    }
}

/// Serializable form of a [`Document`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub id: String,
    pub base: String,
    pub content: String,
    pub operations: Vec<Operation>,
    pub effective: Vec<OperationKind>,
    pub version_vector: VersionVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_through: Option<Timestamp>,
    pub metadata: DocumentMetadata,
}

/// Transform `op` against every earlier concurrent operation, in order
fn effective_form<'a>(
    op: &Operation,
    earlier: impl Iterator<Item = (&'a Operation, &'a OperationKind)>,
    content_len: usize,
) -> OperationKind {
    let mut kind = op.kind.clone();
    for (prior, prior_effective) in earlier {
        if is_concurrent(op, prior) {
            kind = transform_kind(&kind, &op.timestamp, prior_effective, &prior.timestamp);
        }
    }
    kind.clamped(content_len)
}

fn fold(base: &str, kinds: &[OperationKind]) -> Result<String> {
    let mut content = base.to_string();
    for kind in kinds {
        content = apply_to_string(&content, kind)?;
    }
    Ok(content)
}
