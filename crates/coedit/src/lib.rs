//! Real-time collaborative text editing core.
//!
//! Sites edit a shared text document concurrently. Operations are ordered by
//! Lamport timestamps, re-expressed against concurrent peers by operational
//! transform, checked for conflicts, and moved between sites together with
//! live presence over a reconnecting message transport.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod clock;
pub use clock::*;

mod operations;
pub use operations::*;

mod transform;
pub use transform::*;

mod document;
pub use document::*;

mod crdt;
pub use crdt::*;

mod conflict;
pub use conflict::*;

mod resolution;
pub use resolution::*;

mod resolver;
pub use resolver::*;

mod presence;
pub use presence::*;

mod broadcast;
pub use broadcast::*;

mod messages;
pub use messages::*;

mod transport;
pub use transport::*;

mod ws;
pub use ws::*;

mod sync;
pub use sync::*;

mod session;
pub use session::*;

mod state;
pub use state::*;

mod config;
pub use config::*;

mod events;
pub use events::*;

#[derive(Debug, Error)]
pub enum CoeditError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("position {position} out of bounds for document of length {length}")]
    OutOfBounds { position: usize, length: usize },

    #[error("operation {operation} is missing causal dependencies: {missing}")]
    MissingDependencies { operation: String, missing: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send queue full ({0} messages)")]
    QueueFull(usize),

    #[error("not connected")]
    NotConnected,

    #[error("conflict resolution failed: {0}")]
    Resolution(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoeditError {
    /// Short machine-readable code used in `error` wire messages.
    pub fn code(&self) -> &'static str {
        match self {
            CoeditError::InvalidOperation(_) => "invalid_operation",
            CoeditError::OutOfBounds { .. } => "out_of_bounds",
            CoeditError::MissingDependencies { .. } => "missing_dependencies",
            CoeditError::InvalidMessage(_) => "invalid_message",
            CoeditError::UnknownMessageType(_) => "unknown_message_type",
            CoeditError::MessageTooLarge { .. } => "message_too_large",
            CoeditError::Transport(_) => "transport",
            CoeditError::QueueFull(_) => "queue_full",
            CoeditError::NotConnected => "not_connected",
            CoeditError::Resolution(_) => "resolution",
            CoeditError::ConflictNotFound(_) => "conflict_not_found",
            CoeditError::Sync(_) => "sync",
            CoeditError::Serialization(_) => "serialization",
            CoeditError::InvalidState(_) => "invalid_state",
            CoeditError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for CoeditError {
    fn from(e: serde_json::Error) -> Self {
        CoeditError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for CoeditError {
    fn from(e: toml::de::Error) -> Self {
        CoeditError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoeditError>;

/// Identifier of an editing site (one replica of the document)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(pub String);

impl SiteId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SiteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
