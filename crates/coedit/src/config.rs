/// Aggregate engine configuration, loadable from TOML
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{
    CoeditError, ConflictDetectionConfig, CrdtConfig, MessageHandlerConfig, PresenceConfig,
    ResolutionConfig, Result, SiteId, SyncConfig, TransportConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub document_id: String,

    /// Generated when absent. Restored sessions take theirs from the
    /// exported state instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<SiteId>,

    pub user_id: String,

    #[serde(default = "default_device_id")]
    pub device_id: String,

    #[serde(default)]
    pub user_name: String,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub conflicts: ConflictDetectionConfig,

    #[serde(default)]
    pub resolution: ResolutionConfig,

    #[serde(default)]
    pub messages: MessageHandlerConfig,

    #[serde(default)]
    pub crdt: CrdtConfig,
}

fn default_device_id() -> String {
    "default".to_string()
}

impl EngineConfig {
    pub fn new(document_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            document_id: document_id.into(),
            site_id: None,
            user_name: user_id.clone(),
            user_id,
            device_id: default_device_id(),
            sync: SyncConfig::default(),
            transport: TransportConfig::default(),
            presence: PresenceConfig::default(),
            conflicts: ConflictDetectionConfig::default(),
            resolution: ResolutionConfig::default(),
            messages: MessageHandlerConfig::default(),
            crdt: CrdtConfig::default(),
        }
    }

    pub fn with_site_id(mut self, site_id: impl Into<SiteId>) -> Self {
        self.site_id = Some(site_id.into());
        self
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoeditError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.document_id.is_empty() {
            return Err(CoeditError::Config("document_id must not be empty".to_string()));
        }
        if self.user_id.is_empty() {
            return Err(CoeditError::Config("user_id must not be empty".to_string()));
        }
        if self.sync.batch_size == 0 {
            return Err(CoeditError::Config("sync.batch_size must be at least 1".to_string()));
        }
        if self.sync.max_pending_operations < self.sync.batch_size {
            return Err(CoeditError::Config(
                "sync.max_pending_operations must not be below sync.batch_size".to_string(),
            ));
        }
        if self.messages.max_message_size != self.transport.max_message_size {
            tracing::warn!(
                handler = self.messages.max_message_size,
                transport = self.transport.max_message_size,
                "message size limits differ between handler and transport"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            document_id = "notes"
            user_id = "ada"
            "#,
        )
        .unwrap();

        assert_eq!(config.device_id, "default");
        assert!(config.site_id.is_none());
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.transport.max_reconnect_attempts, 5);
        assert_eq!(config.presence.idle_timeout_ms, 30_000);
    }

    #[test]
    fn test_nested_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            document_id = "notes"
            user_id = "ada"
            site_id = "site-a"

            [sync]
            batch_size = 5
            require_ack = false

            [transport]
            url = "ws://relay.local:9300/notes"
            auto_reconnect = false

            [resolution.user_priorities]
            site-a = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.site_id, Some(SiteId::from("site-a")));
        assert_eq!(config.sync.batch_size, 5);
        assert!(!config.sync.require_ack);
        assert!(!config.transport.auto_reconnect);
        assert_eq!(config.resolution.priority_of(&SiteId::from("site-a")), 10);
    }

    #[test]
    fn test_invalid_batch_size_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            document_id = "notes"
            user_id = "ada"
            [sync]
            batch_size = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CoeditError::Config(_)));
    }
}
