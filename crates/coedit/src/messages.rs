/// Wire envelope and message dispatch
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::{
    CoeditError, DocumentSnapshot, Operation, PresenceMessage, Result, VersionVector,
};

/// Message types exchanged between sites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Operation,
    Presence,
    Sync,
    Ack,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Operation => "operation",
            MessageType::Presence => "presence",
            MessageType::Sync => "sync",
            MessageType::Ack => "ack",
            MessageType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "operation" => Some(MessageType::Operation),
            "presence" => Some(MessageType::Presence),
            "sync" => Some(MessageType::Sync),
            "ack" => Some(MessageType::Ack),
            "error" => Some(MessageType::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope
///
/// `type` stays a string so that hosts may allow types this crate does not
/// know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: Value,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub presence: PresenceMessage,
}

/// Catch-up payload.
///
/// A message carrying only `versionVector` asks the peer for everything
/// it has beyond that vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_vector: Option<VersionVector>,
}

impl SyncPayload {
    pub fn is_request(&self) -> bool {
        self.operations.is_none() && self.document.is_none() && self.version_vector.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub original_message_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

impl RealtimeMessage {
    pub fn new(message_type: MessageType, data: Value, sender_id: impl Into<String>) -> Self {
        Self {
            message_type: message_type.as_str().to_string(),
            data,
            timestamp: Utc::now().timestamp_millis(),
            sender_id: sender_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn operation(sender_id: impl Into<String>, operation: &Operation) -> Result<Self> {
        let data = serde_json::to_value(OperationPayload {
            operation: operation.clone(),
        })?;
        Ok(Self::new(MessageType::Operation, data, sender_id))
    }

    pub fn presence(sender_id: impl Into<String>, presence: &PresenceMessage) -> Result<Self> {
        let data = serde_json::to_value(PresencePayload {
            presence: presence.clone(),
        })?;
        Ok(Self::new(MessageType::Presence, data, sender_id))
    }

    pub fn sync(sender_id: impl Into<String>, payload: &SyncPayload) -> Result<Self> {
        Ok(Self::new(
            MessageType::Sync,
            serde_json::to_value(payload)?,
            sender_id,
        ))
    }

    pub fn ack(
        sender_id: impl Into<String>,
        original_message_id: impl Into<String>,
        success: bool,
        error: Option<String>,
    ) -> Result<Self> {
        let data = serde_json::to_value(AckPayload {
            original_message_id: original_message_id.into(),
            success,
            error,
        })?;
        Ok(Self::new(MessageType::Ack, data, sender_id))
    }

    pub fn error(
        sender_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        original_message_id: Option<String>,
    ) -> Result<Self> {
        let data = serde_json::to_value(ErrorPayload {
            code: code.into(),
            message: message.into(),
            original_message_id,
        })?;
        Ok(Self::new(MessageType::Error, data, sender_id))
    }

    pub fn kind(&self) -> Option<MessageType> {
        MessageType::parse(&self.message_type)
    }

    /// Decode `data` into a typed payload
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            CoeditError::InvalidMessage(format!("bad {} payload: {}", self.message_type, e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandlerConfig {
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub allow_unknown_types: bool,
}

pub(crate) fn default_max_message_size() -> usize {
    1024 * 1024
}

impl Default for MessageHandlerConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            allow_unknown_types: false,
        }
    }
}

pub type HandlerFn = Box<dyn FnMut(&RealtimeMessage) -> Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct RegisteredHandler {
    id: HandlerId,
    priority: i32,
    handler: HandlerFn,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Registered handlers ran; failures are collected, not short-circuited
    Handled { ran: usize, errors: Vec<CoeditError> },
    /// No handler for the type; the default handler ran
    Default(Result<()>),
    Unhandled,
}

/// Validates envelopes and dispatches them to handlers by type
pub struct MessageHandler {
    config: MessageHandlerConfig,
    handlers: HashMap<String, Vec<RegisteredHandler>>,
    default_handler: Option<HandlerFn>,
    next_id: u64,
}

impl MessageHandler {
    pub fn new(config: MessageHandlerConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
            default_handler: None,
            next_id: 0,
        }
    }

    pub fn config(&self) -> &MessageHandlerConfig {
        &self.config
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.config.max_message_size {
            return Err(CoeditError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }

    /// Structural checks on an untyped envelope
    pub fn validate_value(&self, value: &Value) -> Result<()> {
        let object = value
            .as_object()
            .ok_or_else(|| CoeditError::InvalidMessage("envelope is not an object".to_string()))?;

        let message_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CoeditError::InvalidMessage("missing type".to_string()))?;

        if !object.get("timestamp").map_or(false, Value::is_number) {
            return Err(CoeditError::InvalidMessage("missing timestamp".to_string()));
        }

        if MessageType::parse(message_type).is_none() && !self.config.allow_unknown_types {
            return Err(CoeditError::UnknownMessageType(message_type.to_string()));
        }
        Ok(())
    }

    /// Parse and validate an inbound text frame
    pub fn parse(&self, raw: &str) -> Result<RealtimeMessage> {
        self.check_size(raw.len())?;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| CoeditError::InvalidMessage(e.to_string()))?;
        self.validate_value(&value)?;
        serde_json::from_value(value).map_err(|e| CoeditError::InvalidMessage(e.to_string()))
    }

    /// Serialize an outbound message, enforcing the size limit
    pub fn encode(&self, message: &RealtimeMessage) -> Result<String> {
        let raw = serde_json::to_string(message)?;
        self.check_size(raw.len())?;
        Ok(raw)
    }

    /// Register a handler for `message_type`. Higher priorities run first;
    /// equal priorities run in registration order.
    pub fn register(
        &mut self,
        message_type: impl Into<String>,
        priority: i32,
        handler: HandlerFn,
    ) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);

        let list = self.handlers.entry(message_type.into()).or_default();
        let at = list.partition_point(|existing| existing.priority >= priority);
        list.insert(
            at,
            RegisteredHandler {
                id,
                priority,
                handler,
            },
        );
        id
    }

    pub fn unregister(&mut self, id: HandlerId) -> bool {
        for list in self.handlers.values_mut() {
            if let Some(idx) = list.iter().position(|h| h.id == id) {
                list.remove(idx);
                return true;
            }
        }
        false
    }

    pub fn set_default_handler(&mut self, handler: HandlerFn) {
        self.default_handler = Some(handler);
    }

    pub fn dispatch(&mut self, message: &RealtimeMessage) -> DispatchOutcome {
        match self.handlers.get_mut(&message.message_type) {
            Some(list) if !list.is_empty() => {
                let mut errors = Vec::new();
                for registered in list.iter_mut() {
                    if let Err(e) = (registered.handler)(message) {
                        warn!(
                            message_type = %message.message_type,
                            message_id = %message.message_id,
                            error = %e,
                            "message handler failed"
                        );
                        errors.push(e);
                    }
                }
                DispatchOutcome::Handled {
                    ran: list.len(),
                    errors,
                }
            }
            _ => match self.default_handler.as_mut() {
                Some(handler) => DispatchOutcome::Default(handler(message)),
                None => {
                    debug!(message_type = %message.message_type, "unhandled message");
                    DispatchOutcome::Unhandled
                }
            },
        }
    }
}
