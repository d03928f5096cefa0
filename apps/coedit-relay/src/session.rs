use coedit::{
    CoeditError, CrdtConfig, CrdtEngine, Document, MessageHandler, MessageHandlerConfig,
    MessageType, OperationPayload, PresenceBroadcaster, PresenceConfig, PresenceKey,
    PresenceMessage, PresencePayload, PresenceState, RealtimeMessage, SiteId, SyncPayload,
};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Site id the relay uses for messages it originates
pub const RELAY_SITE: &str = "relay";

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_message_size: usize,
    pub presence: PresenceConfig,
    pub crdt: CrdtConfig,
}

struct Peer {
    outbound: mpsc::UnboundedSender<String>,
    /// Set by the first presence message the peer sends
    presence: Option<PresenceKey>,
}

/// One document's relay state: an authoritative replica plus the connected
/// peers
pub struct Room {
    document_id: String,
    replica: CrdtEngine,
    presence: PresenceBroadcaster,
    handler: MessageHandler,
    peers: HashMap<String, Peer>,
    /// When the last peer left
    empty_since: Option<Instant>,
}

impl Room {
    pub fn new(document_id: &str, config: &RoomConfig) -> Self {
        info!(document = %document_id, "creating room");
        Self {
            document_id: document_id.to_string(),
            replica: CrdtEngine::new(SiteId::from(RELAY_SITE), document_id, config.crdt.clone()),
            presence: PresenceBroadcaster::new(
                RELAY_SITE,
                config.presence.clone(),
                config.max_message_size,
            ),
            handler: MessageHandler::new(MessageHandlerConfig {
                max_message_size: config.max_message_size,
                allow_unknown_types: false,
            }),
            peers: HashMap::new(),
            empty_since: Some(Instant::now()),
        }
    }

    pub fn document(&self) -> &Document {
        self.replica.document()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn empty_since(&self) -> Option<Instant> {
        self.empty_since
    }

    pub fn presences(&self) -> Vec<PresenceState> {
        self.presence.tracker().presences()
    }

    pub fn join(&mut self, connection_id: &str, outbound: mpsc::UnboundedSender<String>) {
        self.peers.insert(
            connection_id.to_string(),
            Peer {
                outbound,
                presence: None,
            },
        );
        self.empty_since = None;
        info!(document = %self.document_id, connection = %connection_id, peers = self.peers.len(), "peer joined");
    }

    pub fn leave(&mut self, connection_id: &str) {
        if self.peers.remove(connection_id).is_none() {
            return;
        }
        if let Some(gone) = self.presence.unregister_connection(connection_id) {
            debug!(presence = %gone.key(), "presence left");
        }
        if self.peers.is_empty() {
            self.empty_since = Some(Instant::now());
        }
        info!(document = %self.document_id, connection = %connection_id, peers = self.peers.len(), "peer left");
    }

    /// Process one frame from `connection_id`. Operation-bearing messages
    /// are always answered with an ack; other failures with an error message.
    pub fn handle_frame(&mut self, connection_id: &str, raw: &str) -> coedit::Result<()> {
        let message = match self.handler.parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.reply_error(connection_id, &e, None);
                return Err(e);
            }
        };

        match message.kind() {
            Some(MessageType::Operation) | Some(MessageType::Sync) => {
                let result = if message.kind() == Some(MessageType::Operation) {
                    self.on_operation(connection_id, &message, raw)
                } else {
                    self.on_sync(connection_id, &message)
                };
                let ack = RealtimeMessage::ack(
                    RELAY_SITE,
                    message.message_id.clone(),
                    result.is_ok(),
                    result.as_ref().err().map(|e| e.to_string()),
                )?;
                self.send_to(connection_id, &ack);
                result
            }
            Some(MessageType::Presence) => {
                let result = self.on_presence(connection_id, &message);
                if let Err(e) = &result {
                    self.reply_error(connection_id, e, Some(message.message_id.clone()));
                }
                result
            }
            Some(MessageType::Ack) | Some(MessageType::Error) | None => {
                debug!(message_type = %message.message_type, "ignoring message");
                Ok(())
            }
        }
    }

    fn on_operation(
        &mut self,
        connection_id: &str,
        message: &RealtimeMessage,
        raw: &str,
    ) -> coedit::Result<()> {
        let payload: OperationPayload = message.payload()?;
        let op = payload.operation;
        if self.replica.document().is_duplicate(&op) {
            debug!(op = %op.id, "duplicate operation, not relayed");
            return Ok(());
        }

        self.replica.apply_remote_operation(op)?;
        self.relay(connection_id, raw);
        Ok(())
    }

    fn on_sync(&mut self, connection_id: &str, message: &RealtimeMessage) -> coedit::Result<()> {
        let payload: SyncPayload = message.payload()?;

        if payload.is_request() {
            if let Some(remote) = payload.version_vector {
                let reply = SyncPayload {
                    operations: Some(self.replica.document().missing_operations(&remote)),
                    document: None,
                    version_vector: Some(self.replica.document().version_vector().clone()),
                };
                let reply = RealtimeMessage::sync(RELAY_SITE, &reply)?;
                self.send_to(connection_id, &reply);
            }
            return Ok(());
        }

        let before = self.replica.document().version_vector().clone();
        if let Some(snapshot) = payload.document {
            let remote = Document::from_snapshot(snapshot)?;
            self.replica.merge_document(&remote)?;
        }
        if let Some(operations) = payload.operations {
            self.replica.import_operations(operations)?;
        }

        let fresh = self.replica.document().missing_operations(&before);
        if !fresh.is_empty() {
            debug!(operations = fresh.len(), "relaying operations learned through sync");
            let forward = RealtimeMessage::sync(
                RELAY_SITE,
                &SyncPayload {
                    operations: Some(fresh),
                    ..SyncPayload::default()
                },
            )?;
            let frame = self.handler.encode(&forward)?;
            self.relay(connection_id, &frame);
        }
        Ok(())
    }

    fn on_presence(&mut self, connection_id: &str, message: &RealtimeMessage) -> coedit::Result<()> {
        let payload: PresencePayload = message.payload()?;
        let update = payload.presence;
        let origin = update.origin().ok_or_else(|| {
            CoeditError::InvalidMessage("peers may not send presence snapshots".to_string())
        })?;

        let peer = self
            .peers
            .get_mut(connection_id)
            .ok_or_else(|| CoeditError::InvalidState(format!("unknown connection {}", connection_id)))?;

        match peer.presence.clone() {
            Some(key) if key != origin => {
                return Err(CoeditError::InvalidMessage(format!(
                    "presence for {} sent from the connection of {}",
                    origin, key
                )));
            }
            Some(_) => {}
            None => {
                let Some(state) = presence_state(&update) else {
                    return Ok(());
                };
                peer.presence = Some(origin.clone());
                let outbound = peer.outbound.clone();
                self.presence.register_connection(
                    connection_id,
                    &state.user_id,
                    &state.device_id,
                    &state.user_name,
                    outbound,
                );
            }
        }

        if let PresenceMessage::PresenceLeave { .. } = update {
            peer.presence = None;
            self.presence.unregister_connection(connection_id);
            return Ok(());
        }

        self.presence.apply_remote(update.clone(), None);
        self.presence.fan_out(&update, Some(&origin));
        Ok(())
    }

    /// Periodic presence snapshot to every peer
    pub fn heartbeat(&mut self) {
        self.presence.heartbeat();
    }

    pub fn sweep(&mut self) {
        let leaves = self.presence.sweep();
        if !leaves.is_empty() {
            debug!(document = %self.document_id, removed = leaves.len(), "stale presences swept");
        }
    }

    fn relay(&mut self, from: &str, frame: &str) {
        for (id, peer) in &self.peers {
            if id != from && peer.outbound.send(frame.to_string()).is_err() {
                debug!(connection = %id, "peer channel closed");
            }
        }
    }

    fn send_to(&self, connection_id: &str, message: &RealtimeMessage) {
        let Some(peer) = self.peers.get(connection_id) else {
            return;
        };
        match self.handler.encode(message) {
            Ok(frame) => {
                let _ = peer.outbound.send(frame);
            }
            Err(e) => warn!(connection = %connection_id, error = %e, "reply not sent"),
        }
    }

    fn reply_error(&self, connection_id: &str, error: &CoeditError, original: Option<String>) {
        warn!(connection = %connection_id, error = %error, "rejected frame");
        match RealtimeMessage::error(RELAY_SITE, error.code(), error.to_string(), original) {
            Ok(reply) => self.send_to(connection_id, &reply),
            Err(e) => warn!(error = %e, "could not build error reply"),
        }
    }
}

fn presence_state(message: &PresenceMessage) -> Option<&PresenceState> {
    match message {
        PresenceMessage::PresenceUpdate { presence }
        | PresenceMessage::CursorUpdate { presence }
        | PresenceMessage::SelectionUpdate { presence } => Some(presence),
        _ => None,
    }
}
