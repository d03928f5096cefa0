/// CRDT engine: one site's replica of a collaborative document
/// Turns editing intents into operations and integrates remote ones
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::{
    char_len, ApplyOutcome, CoeditError, Document, LamportClock, MergeReport, Operation,
    OperationKind, Result, SiteId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrdtConfig {
    /// Remote operations held back while their dependencies are missing
    #[serde(default = "default_max_buffered_remote")]
    pub max_buffered_remote: usize,

    /// Compact the log down to this many entries when it grows past it
    #[serde(default)]
    pub history_limit: Option<usize>,
}

fn default_max_buffered_remote() -> usize {
    10_000
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            max_buffered_remote: default_max_buffered_remote(),
            history_limit: None,
        }
    }
}

/// An operation that changed the document, with the form it was applied in
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOperation {
    pub operation: Operation,
    pub effective: OperationKind,
}

pub struct CrdtEngine {
    site_id: SiteId,
    clock: LamportClock,
    document: Document,

    /// Local operations not yet handed to the sync layer, in generation order
    pending_local: VecDeque<Operation>,

    /// Remote operations waiting for causal predecessors
    buffered_remote: VecDeque<Operation>,

    config: CrdtConfig,
}

impl CrdtEngine {
    pub fn new(site_id: SiteId, document_id: impl Into<String>, config: CrdtConfig) -> Self {
        let document = Document::new(document_id, site_id.clone());
        Self::with_document(site_id, document, config)
    }

    /// Start from an existing document, e.g. one seeded with content
    pub fn with_document(site_id: SiteId, document: Document, config: CrdtConfig) -> Self {
        let clock =
            LamportClock::with_counter(site_id.clone(), document.version_vector().max_counter());
        Self {
            site_id,
            clock,
            document,
            pending_local: VecDeque::new(),
            buffered_remote: VecDeque::new(),
            config,
        }
    }

    pub(crate) fn from_parts(
        clock: LamportClock,
        document: Document,
        pending_local: Vec<Operation>,
        config: CrdtConfig,
    ) -> Self {
        Self {
            site_id: clock.site_id().clone(),
            clock,
            document,
            pending_local: pending_local.into(),
            buffered_remote: VecDeque::new(),
            config,
        }
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn content(&self) -> &str {
        self.document.content()
    }

    pub fn config(&self) -> &CrdtConfig {
        &self.config
    }

    pub fn insert_text(&mut self, position: usize, text: &str) -> Result<Operation> {
        self.apply_local(OperationKind::Insert {
            position,
            content: text.to_string(),
        })
    }

    pub fn delete_text(&mut self, position: usize, length: usize) -> Result<Operation> {
        self.apply_local(OperationKind::Delete { position, length })
    }

    /// Overwrite text starting at `position` with `text`, replacing as many
    /// characters as `text` has (fewer near the end of the document)
    pub fn update_text(
        &mut self,
        position: usize,
        text: &str,
        properties: Map<String, Value>,
    ) -> Result<Operation> {
        if text.is_empty() {
            return Err(CoeditError::InvalidOperation(
                "update requires non-empty content".to_string(),
            ));
        }
        let len = self.document.len();
        if position > len {
            return Err(CoeditError::OutOfBounds {
                position,
                length: len,
            });
        }
        let length = char_len(text).min(len - position);
        self.apply_local(OperationKind::Update {
            position,
            length,
            content: text.to_string(),
            properties,
        })
    }

    /// Replace exactly `[position, position + length)` with `text`
    pub fn replace_text(
        &mut self,
        position: usize,
        length: usize,
        text: &str,
        properties: Map<String, Value>,
    ) -> Result<Operation> {
        self.apply_local(OperationKind::Update {
            position,
            length,
            content: text.to_string(),
            properties,
        })
    }

    pub fn format_text(
        &mut self,
        position: usize,
        length: usize,
        properties: Map<String, Value>,
    ) -> Result<Operation> {
        self.apply_local(OperationKind::Format {
            position,
            length,
            properties,
        })
    }

    pub fn move_text(&mut self, position: usize, length: usize, target: usize) -> Result<Operation> {
        self.apply_local(OperationKind::Move {
            position,
            length,
            target,
        })
    }

    fn apply_local(&mut self, kind: OperationKind) -> Result<Operation> {
        kind.validate()?;
        check_bounds(&kind, self.document.len())?;

        let timestamp = self.clock.generate();
        let op = Operation::new(timestamp, kind, self.document.version_vector().clone());
        self.document.apply_operation(op.clone())?;

        debug!(site = %self.site_id, op = %op.id, "applied local operation");
        self.pending_local.push_back(op.clone());
        self.maybe_compact();
        Ok(op)
    }

    /// Integrate an operation received from a peer.
    ///
    /// Returns every operation that changed the document as a result: the
    /// operation itself plus any buffered ones it unblocked. Duplicates and
    /// operations that have to wait for predecessors return an empty list.
    pub fn apply_remote_operation(&mut self, op: Operation) -> Result<Vec<AppliedOperation>> {
        op.validate()?;
        self.clock.observe(&op.timestamp);

        match self.document.apply_operation(op.clone()) {
            Ok(ApplyOutcome::Applied { effective, .. }) => {
                let mut applied = vec![AppliedOperation {
                    operation: op,
                    effective,
                }];
                applied.extend(self.drain_buffer());
                self.maybe_compact();
                Ok(applied)
            }
            Ok(ApplyOutcome::Duplicate) => Ok(Vec::new()),
            Err(CoeditError::MissingDependencies { missing, .. }) => {
                debug!(op = %op.id, %missing, "buffering operation until dependencies arrive");
                self.buffer(op);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Integrate a batch of remote operations, e.g. from a sync reply
    pub fn import_operations(&mut self, ops: Vec<Operation>) -> Result<Vec<AppliedOperation>> {
        let mut applied = Vec::new();
        for op in ops {
            applied.extend(self.apply_remote_operation(op)?);
        }
        Ok(applied)
    }

    /// Merge a whole remote document into ours
    pub fn merge_document(&mut self, other: &Document) -> Result<MergeReport> {
        self.clock.advance_to(other.version_vector().max_counter());
        let report = self.document.merge(other)?;
        self.drain_buffer();
        self.maybe_compact();
        Ok(report)
    }

    fn buffer(&mut self, op: Operation) {
        if self.buffered_remote.iter().any(|queued| queued.id == op.id) {
            return;
        }
        if self.buffered_remote.len() >= self.config.max_buffered_remote {
            if let Some(dropped) = self.buffered_remote.pop_front() {
                warn!(
                    op = %dropped.id,
                    limit = self.config.max_buffered_remote,
                    "causal buffer full, dropping oldest operation"
                );
            }
        }
        self.buffered_remote.push_back(op);
    }

    /// Apply buffered operations that became ready, until none are
    fn drain_buffer(&mut self) -> Vec<AppliedOperation> {
        let mut applied = Vec::new();
        let mut progressed = true;

        while progressed && !self.buffered_remote.is_empty() {
            progressed = false;
            let mut waiting: Vec<Operation> = self.buffered_remote.drain(..).collect();
            waiting.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

            for op in waiting {
                match self.document.apply_operation(op.clone()) {
                    Ok(ApplyOutcome::Applied { effective, .. }) => {
                        progressed = true;
                        applied.push(AppliedOperation {
                            operation: op,
                            effective,
                        });
                    }
                    Ok(ApplyOutcome::Duplicate) => {}
                    Err(CoeditError::MissingDependencies { .. }) => {
                        self.buffered_remote.push_back(op)
                    }
                    Err(e) => warn!(op = %op.id, error = %e, "discarding buffered operation"),
                }
            }
        }

        applied
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered_remote.len()
    }

    /// Remove up to `max` of the oldest pending local operations
    pub fn take_pending(&mut self, max: usize) -> Vec<Operation> {
        let count = max.min(self.pending_local.len());
        self.pending_local.drain(..count).collect()
    }

    /// Put a batch that failed to send back at the head of the queue,
    /// ahead of anything generated since
    pub fn requeue_front(&mut self, batch: Vec<Operation>) {
        for op in batch.into_iter().rev() {
            self.pending_local.push_front(op);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending_local.len()
    }

    pub fn pending_operations(&self) -> impl Iterator<Item = &Operation> {
        self.pending_local.iter()
    }

    /// Fold all but the newest `max_ops` log entries into the base text
    pub fn compact(&mut self, max_ops: usize) -> Result<usize> {
        self.document.compress_history(max_ops)
    }

    fn maybe_compact(&mut self) {
        let Some(limit) = self.config.history_limit else {
            return;
        };
        if self.document.operations().len() > limit {
            if let Err(e) = self.document.compress_history(limit) {
                warn!(site = %self.site_id, error = %e, "history compaction failed");
            }
        }
    }
}

/// Local intents must address text that exists right now
fn check_bounds(kind: &OperationKind, len: usize) -> Result<()> {
    let end = match kind {
        OperationKind::Insert { position, .. } => *position,
        OperationKind::Move { target, .. } => kind.end().max(*target),
        _ => kind.end(),
    };
    if end > len {
        return Err(CoeditError::OutOfBounds {
            position: end,
            length: len,
        });
    }
    Ok(())
}
