/// Conflict resolver: owns detected conflicts until they are resolved
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

use crate::{
    auto_resolve, choose_strategy, detect_conflicts, resolve_conflict, CoeditError,
    ConflictDetectionConfig, ConflictInfo, ConflictType, Operation, OperationId,
    ResolutionConfig, ResolutionResult, ResolutionStrategy, Result, Subscribers,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ConflictEvent {
    Detected(ConflictInfo),
    Resolved {
        conflict: ConflictInfo,
        result: ResolutionResult,
    },
    ResolutionFailed {
        conflict: ConflictInfo,
        error: String,
    },
    Dismissed(ConflictInfo),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictStats {
    pub detected: u64,
    pub resolved: u64,
    pub failed: u64,
    pub dismissed: u64,
    pub by_type: HashMap<ConflictType, u64>,
}

pub struct ConflictResolver {
    detection: ConflictDetectionConfig,
    resolution: ResolutionConfig,
    active: Vec<ConflictInfo>,
    history: VecDeque<ConflictInfo>,

    /// Operation pairs already reported, smaller id first
    reported: HashSet<(OperationId, OperationId)>,

    stats: ConflictStats,
    events: Subscribers<ConflictEvent>,
}

impl ConflictResolver {
    pub fn new(detection: ConflictDetectionConfig, resolution: ResolutionConfig) -> Self {
        Self {
            detection,
            resolution,
            active: Vec::new(),
            history: VecDeque::new(),
            reported: HashSet::new(),
            stats: ConflictStats::default(),
            events: Subscribers::new(),
        }
    }

    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<ConflictEvent> {
        self.events.subscribe()
    }

    pub fn detection_config(&self) -> &ConflictDetectionConfig {
        &self.detection
    }

    pub fn resolution_config(&self) -> &ResolutionConfig {
        &self.resolution
    }

    /// Record new conflicts between `op` and the log. Pairs that were
    /// already reported are skipped.
    pub fn check_operation(&mut self, op: &Operation, log: &[Operation]) -> Vec<ConflictInfo> {
        let mut fresh = Vec::new();

        for conflict in detect_conflicts(op, log, &self.detection) {
            let key = pair_key(&conflict);
            if !self.reported.insert(key) {
                continue;
            }

            info!(
                conflict = %conflict.id,
                kind = %conflict.conflict_type,
                severity = ?conflict.severity,
                op1 = %conflict.operation1.id,
                op2 = %conflict.operation2.id,
                "conflict detected"
            );
            self.stats.detected += 1;
            *self.stats.by_type.entry(conflict.conflict_type).or_insert(0) += 1;
            self.active.push(conflict.clone());
            self.events.emit(ConflictEvent::Detected(conflict.clone()));
            fresh.push(conflict);
        }

        fresh
    }

    /// Detect conflicts for `op` and, if auto-resolution is on, resolve
    /// them with the heuristically chosen strategy.
    ///
    /// Returns the results that resolved. Conflicts left unresolved stay
    /// active for the host to handle.
    pub fn process_operation(&mut self, op: &Operation, log: &[Operation]) -> Vec<ResolutionResult> {
        let fresh = self.check_operation(op, log);
        if !self.detection.auto_resolve {
            return Vec::new();
        }

        let mut results = Vec::new();
        for conflict in fresh {
            match auto_resolve(&conflict, &self.resolution) {
                Ok(result) if result.resolved => {
                    self.finish(&conflict.id, result.clone());
                    results.push(result);
                }
                Ok(result) => {
                    debug!(
                        conflict = %conflict.id,
                        strategy = %choose_strategy(&conflict, &self.resolution),
                        message = ?result.message,
                        "conflict left for manual resolution"
                    );
                }
                Err(e) => self.fail(&conflict, &e),
            }
        }
        results
    }

    /// Resolve an active conflict with the configured default strategy
    pub fn resolve(&mut self, conflict_id: &str) -> Result<ResolutionResult> {
        self.resolve_with(conflict_id, self.resolution.default_strategy)
    }

    /// Resolve an active conflict with an explicit strategy.
    ///
    /// A strategy that declines (such as `manual`) leaves the conflict active.
    pub fn resolve_with(
        &mut self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ResolutionResult> {
        let conflict = self.find(conflict_id)?.clone();

        match resolve_conflict(&conflict, strategy, &self.resolution) {
            Ok(result) => {
                if result.resolved {
                    self.finish(conflict_id, result.clone());
                }
                Ok(result)
            }
            Err(e) => {
                self.fail(&conflict, &e);
                Err(e)
            }
        }
    }

    /// Resolve an active conflict with operations chosen by a person
    pub fn resolve_manually(
        &mut self,
        conflict_id: &str,
        chosen: Vec<Operation>,
    ) -> Result<ResolutionResult> {
        self.find(conflict_id)?;
        for op in &chosen {
            op.validate()?;
        }

        let result = ResolutionResult {
            resolved: true,
            strategy: ResolutionStrategy::Manual,
            resolved_operations: chosen,
            message: Some("resolved manually".to_string()),
        };
        self.finish(conflict_id, result.clone());
        Ok(result)
    }

    /// Drop an active conflict without resolving it
    pub fn dismiss(&mut self, conflict_id: &str) -> Result<ConflictInfo> {
        let idx = self.position(conflict_id)?;
        let conflict = self.active.remove(idx);

        self.stats.dismissed += 1;
        self.push_history(conflict.clone());
        self.events.emit(ConflictEvent::Dismissed(conflict.clone()));
        Ok(conflict)
    }

    pub fn active_conflicts(&self) -> &[ConflictInfo] {
        &self.active
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Option<&ConflictInfo> {
        self.active
            .iter()
            .chain(self.history.iter())
            .find(|c| c.id == conflict_id)
    }

    pub fn history(&self) -> impl Iterator<Item = &ConflictInfo> {
        self.history.iter()
    }

    pub fn stats(&self) -> &ConflictStats {
        &self.stats
    }

    fn position(&self, conflict_id: &str) -> Result<usize> {
        self.active
            .iter()
            .position(|c| c.id == conflict_id)
            .ok_or_else(|| CoeditError::ConflictNotFound(conflict_id.to_string()))
    }

    fn find(&self, conflict_id: &str) -> Result<&ConflictInfo> {
        let idx = self.position(conflict_id)?;
        Ok(&self.active[idx])
    }

    fn finish(&mut self, conflict_id: &str, result: ResolutionResult) {
        let Ok(idx) = self.position(conflict_id) else {
            return;
        };
        let mut conflict = self.active.remove(idx);
        conflict.mark_resolved(result.strategy);

        info!(conflict = %conflict.id, strategy = %result.strategy, "conflict resolved");
        self.stats.resolved += 1;
        self.push_history(conflict.clone());
        self.events.emit(ConflictEvent::Resolved { conflict, result });
    }

    fn fail(&mut self, conflict: &ConflictInfo, error: &CoeditError) {
        warn!(conflict = %conflict.id, error = %error, "conflict resolution failed");
        self.stats.failed += 1;
        self.events.emit(ConflictEvent::ResolutionFailed {
            conflict: conflict.clone(),
            error: error.to_string(),
        });
    }

    fn push_history(&mut self, conflict: ConflictInfo) {
        self.history.push_back(conflict);
        while self.history.len() > self.resolution.max_history {
            if let Some(evicted) = self.history.pop_front() {
                self.reported.remove(&pair_key(&evicted));
            }
        }
    }
}

fn pair_key(conflict: &ConflictInfo) -> (OperationId, OperationId) {
    let a = conflict.operation1.id.clone();
    let b = conflict.operation2.id.clone();
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}
