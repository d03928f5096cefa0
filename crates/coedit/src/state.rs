/// Persisted session state
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CoeditError, DocumentSnapshot, LamportClock, Operation, PresenceState, Result, SiteId,
};

/// Bumped whenever the exported layout changes incompatibly
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Everything a host needs to persist to resume a site later.
///
/// Pending operations are already part of `document`; they are kept so they
/// can be sent once the session reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedState {
    pub format_version: u32,
    pub site_id: SiteId,
    pub clock: LamportClock,
    pub document: DocumentSnapshot,
    #[serde(default)]
    pub pending_operations: Vec<Operation>,
    #[serde(default)]
    pub presences: Vec<PresenceState>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub exported_at: DateTime<Utc>,
}

impl ExportedState {
    pub fn new(
        clock: LamportClock,
        document: DocumentSnapshot,
        pending_operations: Vec<Operation>,
        presences: Vec<PresenceState>,
    ) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            site_id: clock.site_id().clone(),
            clock,
            document,
            pending_operations,
            presences,
            exported_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(raw)?;
        state.validate()?;
        Ok(state)
    }

    pub fn validate(&self) -> Result<()> {
        if self.format_version != STATE_FORMAT_VERSION {
            return Err(CoeditError::InvalidState(format!(
                "unsupported state format {} (expected {})",
                self.format_version, STATE_FORMAT_VERSION
            )));
        }
        if self.clock.site_id() != &self.site_id {
            return Err(CoeditError::InvalidState(
                "clock belongs to a different site".to_string(),
            ));
        }

        for op in &self.pending_operations {
            op.validate()?;
            if op.site_id != self.site_id {
                return Err(CoeditError::InvalidState(format!(
                    "pending operation {} was not generated by {}",
                    op.id, self.site_id
                )));
            }
            if !self.document.operations.iter().any(|logged| logged.id == op.id)
                && op.timestamp.counter > self.document.version_vector.get(&self.site_id)
            {
                return Err(CoeditError::InvalidState(format!(
                    "pending operation {} is not reflected in the document",
                    op.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CrdtConfig, CrdtEngine};

    fn exported() -> ExportedState {
        let mut engine = CrdtEngine::new(SiteId::from("a"), "doc", CrdtConfig::default());
        engine.insert_text(0, "hi").unwrap();
        let pending: Vec<Operation> = engine.pending_operations().cloned().collect();
        ExportedState::new(
            engine.clock().clone(),
            engine.document().snapshot(),
            pending,
            Vec::new(),
        )
    }

    #[test]
    fn test_json_round_trip() {
        let state = exported();
        let raw = state.to_json().unwrap();
        assert!(raw.contains("\"formatVersion\":1"));

        let restored = ExportedState::from_json(&raw).unwrap();
        assert_eq!(restored.site_id, SiteId::from("a"));
        assert_eq!(restored.pending_operations, state.pending_operations);
        assert_eq!(restored.document.content, "hi");
    }

    #[test]
    fn test_rejects_future_format() {
        let mut state = exported();
        state.format_version = 99;
        let raw = serde_json::to_string(&state).unwrap();
        assert!(matches!(
            ExportedState::from_json(&raw),
            Err(CoeditError::InvalidState(_))
        ));
    }

    #[test]
    fn test_rejects_foreign_pending_operation() {
        let mut state = exported();
        state.site_id = SiteId::from("b");
        state.clock = LamportClock::new(SiteId::from("b"));
        let raw = serde_json::to_string(&state).unwrap();
        assert!(ExportedState::from_json(&raw).is_err());
    }
}
