/// Conflict resolution strategies
///
/// Each strategy is a pure function of a conflict and the resolution config.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{
    transform, CoeditError, ConflictInfo, ConflictType, Operation, Result, SiteId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// Keep the operation with the later Lamport timestamp
    LastWriteWins,

    /// Keep both, re-expressing the later one after the earlier one
    OperationalTransform,

    /// Prefer the site with the higher configured priority
    PriorityBased,

    /// Leave the decision to a human
    Manual,

    /// Try a configured list of strategies in order
    Hybrid,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriteWins => "last-write-wins",
            ResolutionStrategy::OperationalTransform => "operational-transform",
            ResolutionStrategy::PriorityBased => "priority-based",
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionConfig {
    #[serde(default = "default_strategy")]
    pub default_strategy: ResolutionStrategy,

    /// Priority weight per site; higher wins
    #[serde(default)]
    pub user_priorities: HashMap<SiteId, i32>,

    /// Strategies tried in order by `hybrid`
    #[serde(default = "default_hybrid_strategies")]
    pub hybrid_strategies: Vec<ResolutionStrategy>,

    /// Resolved and dismissed conflicts kept for inspection
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_strategy() -> ResolutionStrategy {
    ResolutionStrategy::OperationalTransform
}

fn default_max_history() -> usize {
    1000
}

fn default_hybrid_strategies() -> Vec<ResolutionStrategy> {
    vec![
        ResolutionStrategy::OperationalTransform,
        ResolutionStrategy::LastWriteWins,
    ]
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            default_strategy: default_strategy(),
            user_priorities: HashMap::new(),
            hybrid_strategies: default_hybrid_strategies(),
            max_history: default_max_history(),
        }
    }
}

impl ResolutionConfig {
    pub fn priority_of(&self, site: &SiteId) -> i32 {
        self.user_priorities.get(site).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResult {
    pub resolved: bool,
    pub strategy: ResolutionStrategy,
    pub resolved_operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResolutionResult {
    fn resolved(strategy: ResolutionStrategy, operations: Vec<Operation>) -> Self {
        Self {
            resolved: true,
            strategy,
            resolved_operations: operations,
            message: None,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Orders both operations by timestamp, earlier first
fn ordered(conflict: &ConflictInfo) -> (&Operation, &Operation) {
    if conflict.operation1.timestamp > conflict.operation2.timestamp {
        (&conflict.operation2, &conflict.operation1)
    } else {
        (&conflict.operation1, &conflict.operation2)
    }
}

pub fn last_write_wins(conflict: &ConflictInfo) -> Result<ResolutionResult> {
    let (_, later) = ordered(conflict);
    Ok(
        ResolutionResult::resolved(ResolutionStrategy::LastWriteWins, vec![later.clone()])
            .with_message(format!("kept {} ({})", later.id, later.timestamp)),
    )
}

pub fn operational_transform(conflict: &ConflictInfo) -> Result<ResolutionResult> {
    if conflict.operation1.site_id == conflict.operation2.site_id {
        return Err(CoeditError::Resolution(
            "operations from the same site are already ordered".to_string(),
        ));
    }

    let (earlier, later) = ordered(conflict);
    Ok(ResolutionResult::resolved(
        ResolutionStrategy::OperationalTransform,
        vec![earlier.clone(), transform(later, earlier)],
    ))
}

pub fn priority_based(conflict: &ConflictInfo, config: &ResolutionConfig) -> Result<ResolutionResult> {
    let p1 = config.priority_of(&conflict.operation1.site_id);
    let p2 = config.priority_of(&conflict.operation2.site_id);

    let winner = match p1.cmp(&p2) {
        std::cmp::Ordering::Greater => &conflict.operation1,
        std::cmp::Ordering::Less => &conflict.operation2,
        std::cmp::Ordering::Equal => {
            let mut result = last_write_wins(conflict)?;
            result.strategy = ResolutionStrategy::PriorityBased;
            return Ok(result.with_message("equal priorities, fell back to last-write-wins"));
        }
    };

    Ok(
        ResolutionResult::resolved(ResolutionStrategy::PriorityBased, vec![winner.clone()])
            .with_message(format!("site {} has priority", winner.site_id)),
    )
}

pub fn manual(_conflict: &ConflictInfo) -> Result<ResolutionResult> {
    Ok(ResolutionResult {
        resolved: false,
        strategy: ResolutionStrategy::Manual,
        resolved_operations: Vec::new(),
        message: Some("manual resolution required".to_string()),
    })
}

pub fn hybrid(conflict: &ConflictInfo, config: &ResolutionConfig) -> Result<ResolutionResult> {
    for &strategy in &config.hybrid_strategies {
        if strategy == ResolutionStrategy::Hybrid {
            continue;
        }
        match resolve_conflict(conflict, strategy, config) {
            Ok(result) if result.resolved => return Ok(result),
            Ok(_) => {}
            Err(e) => tracing::debug!(%strategy, error = %e, "hybrid strategy failed"),
        }
    }
    manual(conflict)
}

/// Resolve with an explicitly chosen strategy
pub fn resolve_conflict(
    conflict: &ConflictInfo,
    strategy: ResolutionStrategy,
    config: &ResolutionConfig,
) -> Result<ResolutionResult> {
    match strategy {
        ResolutionStrategy::LastWriteWins => last_write_wins(conflict),
        ResolutionStrategy::OperationalTransform => operational_transform(conflict),
        ResolutionStrategy::PriorityBased => priority_based(conflict, config),
        ResolutionStrategy::Manual => manual(conflict),
        ResolutionStrategy::Hybrid => hybrid(conflict, config),
    }
}

/// Pick a strategy from the conflict's type; configured priorities win
pub fn choose_strategy(conflict: &ConflictInfo, config: &ResolutionConfig) -> ResolutionStrategy {
    if !config.user_priorities.is_empty() {
        return ResolutionStrategy::PriorityBased;
    }
    match conflict.conflict_type {
        ConflictType::InsertInsert | ConflictType::InsertDelete | ConflictType::DeleteDelete => {
            ResolutionStrategy::OperationalTransform
        }
        ConflictType::UpdateUpdate => ResolutionStrategy::Manual,
    }
}

pub fn auto_resolve(conflict: &ConflictInfo, config: &ResolutionConfig) -> Result<ResolutionResult> {
    resolve_conflict(conflict, choose_strategy(conflict, config), config)
}
