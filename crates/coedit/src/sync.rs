/// Synchronization engine
///
/// Binds one site's CRDT replica to presence, conflict resolution and
/// message handling, and moves operations over a `Transport`. Local edits
/// apply immediately and queue for sync; the queue flushes in batches with
/// at most one batch in flight.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    AckPayload, CoeditError, ConflictEvent, ConflictInfo, ConflictResolver, ConflictStats,
    ConnectionState, CrdtEngine, Document, EngineConfig, ErrorPayload, ExportedState,
    MessageHandler, MessageType, Operation, OperationKind, OperationPayload, PresenceBroadcaster,
    PresenceEvent, PresenceKey, PresenceMessage, PresencePayload, PresenceState, PresenceUpdate,
    RealtimeMessage, ResolutionResult, ResolutionStrategy, Result, SelectionRange, SendOutcome,
    SiteId, Subscribers, SyncPayload, Transport, TransportEvent, VersionVector,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Pending operations that trigger a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    #[serde(default = "default_max_pending_operations")]
    pub max_pending_operations: usize,
    /// Consecutive failed batches before an error is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Keep each batch in flight until the peer acknowledges it
    #[serde(default = "default_require_ack")]
    pub require_ack: bool,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

fn default_batch_size() -> usize {
    50
}

fn default_sync_interval_ms() -> u64 {
    1_000
}

fn default_max_pending_operations() -> usize {
    1_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_require_ack() -> bool {
    true
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sync_interval_ms: default_sync_interval_ms(),
            max_pending_operations: default_max_pending_operations(),
            max_retries: default_max_retries(),
            require_ack: default_require_ack(),
            ack_timeout_ms: default_ack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub operations_sent: u64,
    pub operations_received: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub messages_received: u64,
    pub messages_rejected: u64,
    pub conflicts: ConflictStats,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_operations: usize,
    pub buffered_operations: usize,
    pub flush_in_flight: bool,
}

/// Events surfaced to the host editor
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ContentChanged(String),
    /// A local edit was applied
    OperationApplied(Operation),
    RemoteOperationApplied {
        operation: Operation,
        effective: OperationKind,
    },
    ConflictDetected(ConflictInfo),
    ConflictResolved {
        conflict: ConflictInfo,
        result: ResolutionResult,
    },
    PresenceUpdated(PresenceEvent),
    Connected,
    Disconnected,
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing pending
    Empty,
    /// Another batch is still in flight; the request was dropped
    InFlight,
    Sent { operations: usize },
    /// Timer tick skipped while the transport is not connected
    Offline,
    /// The batch went back to the head of the queue
    Failed,
}

struct InFlightBatch {
    operations: Vec<Operation>,
    /// Message ids not yet acknowledged
    awaiting: HashSet<String>,
    sent_at: DateTime<Utc>,
}

pub struct SyncEngine<T: Transport> {
    config: EngineConfig,
    site_id: SiteId,
    local_key: PresenceKey,

    crdt: CrdtEngine,
    presence: PresenceBroadcaster,
    resolver: ConflictResolver,
    handler: MessageHandler,
    transport: T,

    in_flight: Option<InFlightBatch>,
    retries: u32,
    stats: SyncStats,

    conflict_events: mpsc::UnboundedReceiver<ConflictEvent>,
    presence_events: mpsc::UnboundedReceiver<PresenceEvent>,
    events: Subscribers<EngineEvent>,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(config: EngineConfig, transport: T) -> Self {
        let site_id = config.site_id.clone().unwrap_or_default();
        let crdt = CrdtEngine::new(site_id, config.document_id.clone(), config.crdt.clone());
        Self::assemble(config, crdt, transport)
    }

    /// Start from an existing document, such as a shared seed text
    pub fn with_document(config: EngineConfig, document: Document, transport: T) -> Self {
        let site_id = config.site_id.clone().unwrap_or_default();
        let crdt = CrdtEngine::with_document(site_id, document, config.crdt.clone());
        Self::assemble(config, crdt, transport)
    }

    /// Restore a session saved with `export_state`
    pub fn import_state(config: EngineConfig, raw: &str, transport: T) -> Result<Self> {
        let state = ExportedState::from_json(raw)?;
        if state.document.id != config.document_id {
            return Err(CoeditError::InvalidState(format!(
                "state is for document {}, not {}",
                state.document.id, config.document_id
            )));
        }

        let presences = state.presences;
        let pending = state.pending_operations;
        let mut clock = state.clock;
        let document = Document::from_snapshot(state.document)?;
        clock.advance_to(document.version_vector().max_counter());

        let crdt = CrdtEngine::from_parts(clock, document, pending, config.crdt.clone());
        let mut engine = Self::assemble(config, crdt, transport);
        let local = engine.local_key.clone();
        engine
            .presence
            .apply_remote(PresenceMessage::PresenceSync { presences }, Some(&local));
        engine.drain_component_events();

        info!(
            site = %engine.site_id,
            document = %engine.config.document_id,
            pending = engine.crdt.pending_count(),
            "session state imported"
        );
        Ok(engine)
    }

    fn assemble(mut config: EngineConfig, crdt: CrdtEngine, transport: T) -> Self {
        let site_id = crdt.site_id().clone();
        config.site_id = Some(site_id.clone());

        let mut presence = PresenceBroadcaster::new(
            site_id.as_str(),
            config.presence.clone(),
            config.messages.max_message_size,
        );
        let presence_events = presence.subscribe();
        presence.update_presence(
            &config.user_id,
            &config.device_id,
            &config.user_name,
            PresenceUpdate::default(),
        );
        let local_key = PresenceKey::new(config.user_id.clone(), config.device_id.clone());
        presence.pin_presence(local_key.clone());

        let mut resolver = ConflictResolver::new(config.conflicts.clone(), config.resolution.clone());
        let conflict_events = resolver.subscribe();

        let mut engine = Self {
            handler: MessageHandler::new(config.messages.clone()),
            config,
            site_id,
            local_key,
            crdt,
            presence,
            resolver,
            transport,
            in_flight: None,
            retries: 0,
            stats: SyncStats::default(),
            conflict_events,
            presence_events,
            events: Subscribers::new(),
        };
        engine.drain_component_events();
        engine
    }

    pub fn site_id(&self) -> &SiteId {
        &self.site_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn content(&self) -> &str {
        self.crdt.content()
    }

    pub fn document(&self) -> &Document {
        self.crdt.document()
    }

    pub fn crdt(&self) -> &CrdtEngine {
        &self.crdt
    }

    pub fn presences(&self) -> Vec<PresenceState> {
        self.presence.tracker().presences()
    }

    pub fn local_presence(&self) -> Option<&PresenceState> {
        self.presence
            .tracker()
            .get(&self.local_key.user_id, &self.local_key.device_id)
    }

    pub fn active_conflicts(&self) -> &[ConflictInfo] {
        self.resolver.active_conflicts()
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Host handlers run after the engine has processed a message
    pub fn message_handler_mut(&mut self) -> &mut MessageHandler {
        &mut self.handler
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn is_flush_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            conflicts: self.resolver.stats().clone(),
            pending_operations: self.crdt.pending_count(),
            buffered_operations: self.crdt.buffered_count(),
            flush_in_flight: self.in_flight.is_some(),
            ..self.stats.clone()
        }
    }

    // Local editing

    pub fn insert_text(&mut self, position: usize, text: &str) -> Result<Operation> {
        let op = self.crdt.insert_text(position, text)?;
        Ok(self.after_local(op))
    }

    pub fn delete_text(&mut self, position: usize, length: usize) -> Result<Operation> {
        let op = self.crdt.delete_text(position, length)?;
        Ok(self.after_local(op))
    }

    pub fn update_text(
        &mut self,
        position: usize,
        text: &str,
        properties: Option<Map<String, Value>>,
    ) -> Result<Operation> {
        let op = self
            .crdt
            .update_text(position, text, properties.unwrap_or_default())?;
        Ok(self.after_local(op))
    }

    pub fn replace_text(
        &mut self,
        position: usize,
        length: usize,
        text: &str,
        properties: Option<Map<String, Value>>,
    ) -> Result<Operation> {
        let op = self
            .crdt
            .replace_text(position, length, text, properties.unwrap_or_default())?;
        Ok(self.after_local(op))
    }

    pub fn format_text(
        &mut self,
        position: usize,
        length: usize,
        properties: Map<String, Value>,
    ) -> Result<Operation> {
        let op = self.crdt.format_text(position, length, properties)?;
        Ok(self.after_local(op))
    }

    pub fn move_text(&mut self, position: usize, length: usize, target: usize) -> Result<Operation> {
        let op = self.crdt.move_text(position, length, target)?;
        Ok(self.after_local(op))
    }

    fn after_local(&mut self, op: Operation) -> Operation {
        self.events.emit(EngineEvent::OperationApplied(op.clone()));
        self.events
            .emit(EngineEvent::ContentChanged(self.crdt.content().to_string()));

        let pending = self.crdt.pending_count();
        if pending >= self.config.sync.max_pending_operations {
            debug!(pending, "pending cap reached, forcing flush");
            if self.flush() == FlushOutcome::InFlight {
                warn!(pending, "pending operations over cap while a batch is in flight");
            }
        } else if pending >= self.config.sync.batch_size {
            self.flush();
        }
        self.drain_component_events();
        op
    }

    // Outgoing sync

    pub fn flush(&mut self) -> FlushOutcome {
        self.flush_at(Utc::now())
    }

    pub fn flush_at(&mut self, now: DateTime<Utc>) -> FlushOutcome {
        if self.in_flight.is_some() {
            debug!("flush already in flight, dropping request");
            return FlushOutcome::InFlight;
        }
        if self.crdt.pending_count() == 0 {
            return FlushOutcome::Empty;
        }

        let batch = self.crdt.take_pending(self.config.sync.batch_size);
        match self.send_batch(&batch) {
            Ok(message_ids) => {
                let count = batch.len();
                self.stats.batches_sent += 1;
                self.stats.operations_sent += count as u64;
                debug!(site = %self.site_id, operations = count, "sync batch sent");

                if self.config.sync.require_ack {
                    self.in_flight = Some(InFlightBatch {
                        operations: batch,
                        awaiting: message_ids.into_iter().collect(),
                        sent_at: now,
                    });
                } else {
                    self.complete_batch(now);
                }
                FlushOutcome::Sent { operations: count }
            }
            Err(e) => {
                self.fail_batch(batch, &e);
                FlushOutcome::Failed
            }
        }
    }

    /// Periodic timer: expire an unacknowledged batch, then flush
    pub fn tick(&mut self) -> FlushOutcome {
        self.tick_at(Utc::now())
    }

    pub fn tick_at(&mut self, now: DateTime<Utc>) -> FlushOutcome {
        // Offline, frames already wait in the transport queue and the
        // acknowledgement clock restarts on reconnect
        if self.transport.state() != ConnectionState::Connected {
            return FlushOutcome::Offline;
        }

        let timeout = Duration::milliseconds(self.config.sync.ack_timeout_ms as i64);
        let expired = self
            .in_flight
            .as_ref()
            .map_or(false, |batch| now - batch.sent_at >= timeout);
        if expired {
            if let Some(batch) = self.in_flight.take() {
                self.fail_batch(
                    batch.operations,
                    &CoeditError::Sync("acknowledgement timed out".to_string()),
                );
            }
        }

        let outcome = self.flush_at(now);
        self.drain_component_events();
        outcome
    }

    fn send_batch(&mut self, batch: &[Operation]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(batch.len());
        for op in batch {
            let message = RealtimeMessage::operation(self.site_id.as_str(), op)?;
            self.send_message(&message)?;
            ids.push(message.message_id);
        }
        Ok(ids)
    }

    fn send_message(&mut self, message: &RealtimeMessage) -> Result<SendOutcome> {
        let frame = self.handler.encode(message)?;
        self.transport.send(frame)
    }

    fn complete_batch(&mut self, now: DateTime<Utc>) {
        self.retries = 0;
        self.stats.last_sync = Some(now);
    }

    fn fail_batch(&mut self, batch: Vec<Operation>, error: &CoeditError) {
        let count = batch.len();
        self.crdt.requeue_front(batch);
        self.retries += 1;
        self.stats.batches_failed += 1;
        warn!(
            site = %self.site_id,
            operations = count,
            retries = self.retries,
            error = %error,
            "sync batch failed, requeued"
        );

        if self.retries > self.config.sync.max_retries {
            self.emit_error(
                "sync",
                format!("sync failed {} times in a row: {}", self.retries, error),
            );
        }
    }

    fn handle_ack(&mut self, ack: AckPayload, now: DateTime<Utc>) {
        let done = match self.in_flight.as_mut() {
            Some(batch) => {
                if !batch.awaiting.remove(&ack.original_message_id) {
                    return;
                }
                batch.awaiting.is_empty()
            }
            None => return,
        };

        if !ack.success {
            if let Some(batch) = self.in_flight.take() {
                let reason = ack.error.unwrap_or_else(|| "rejected by peer".to_string());
                self.fail_batch(batch.operations, &CoeditError::Sync(reason));
            }
        } else if done {
            self.in_flight = None;
            self.complete_batch(now);
        }
    }

    fn handle_error_message(&mut self, error: ErrorPayload) {
        let names_batch = match (&error.original_message_id, &self.in_flight) {
            (Some(id), Some(batch)) => batch.awaiting.contains(id),
            _ => false,
        };
        if names_batch {
            if let Some(batch) = self.in_flight.take() {
                self.fail_batch(batch.operations, &CoeditError::Sync(error.message.clone()));
            }
        }
        self.emit_error(error.code, error.message);
    }

    // Incoming

    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected { .. } => {
                self.on_disconnected();
                Ok(())
            }
            TransportEvent::Message(frame) => self.handle_incoming(&frame),
            TransportEvent::Error(error) => {
                self.emit_error("transport", error);
                Ok(())
            }
            TransportEvent::ReconnectFailed { attempts } => {
                self.emit_error(
                    "reconnect_failed",
                    format!("gave up reconnecting after {} attempts", attempts),
                );
                Ok(())
            }
            TransportEvent::StateChanged { .. } | TransportEvent::ReconnectScheduled { .. } => Ok(()),
        }
    }

    /// Catch up with the peer, announce presence and push the backlog
    pub fn on_connected(&mut self) -> Result<()> {
        info!(site = %self.site_id, "connected");
        self.events.emit(EngineEvent::Connected);

        let request = SyncPayload {
            version_vector: Some(self.crdt.document().version_vector().clone()),
            ..SyncPayload::default()
        };
        self.send_message(&RealtimeMessage::sync(self.site_id.as_str(), &request)?)?;

        // A batch handed over while offline went out with the queue flush
        if let Some(batch) = self.in_flight.as_mut() {
            batch.sent_at = Utc::now();
        }

        if let Some(own) = self.local_presence().cloned() {
            self.publish_presence(PresenceMessage::PresenceUpdate { presence: own })?;
        }

        self.flush();
        self.drain_component_events();
        Ok(())
    }

    /// An unacknowledged batch goes back to the queue; nothing is dropped
    pub fn on_disconnected(&mut self) {
        if let Some(batch) = self.in_flight.take() {
            debug!(operations = batch.operations.len(), "requeueing in-flight batch");
            self.crdt.requeue_front(batch.operations);
        }
        self.events.emit(EngineEvent::Disconnected);
    }

    /// Process one inbound text frame
    pub fn handle_incoming(&mut self, raw: &str) -> Result<()> {
        self.stats.messages_received += 1;

        let message = match self.handler.parse(raw) {
            Ok(message) => message,
            Err(e) => {
                self.reject(&e);
                return Err(e);
            }
        };
        if message.sender_id == self.site_id.as_str() {
            return Ok(());
        }

        let result = self.route(&message, Utc::now());
        if let Err(e) = &result {
            self.reject(e);
        }

        self.handler.dispatch(&message);
        self.drain_component_events();
        result
    }

    fn reject(&mut self, error: &CoeditError) {
        self.stats.messages_rejected += 1;
        warn!(site = %self.site_id, error = %error, "rejected inbound message");
        self.emit_error(error.code(), error.to_string());
    }

    fn route(&mut self, message: &RealtimeMessage, now: DateTime<Utc>) -> Result<()> {
        match message.kind() {
            Some(MessageType::Operation) => {
                let payload: OperationPayload = message.payload()?;
                self.integrate_remote(vec![payload.operation])
            }
            Some(MessageType::Sync) => self.handle_sync(message.payload()?),
            Some(MessageType::Presence) => {
                let payload: PresencePayload = message.payload()?;
                self.presence
                    .apply_remote(payload.presence, Some(&self.local_key));
                Ok(())
            }
            Some(MessageType::Ack) => {
                self.handle_ack(message.payload()?, now);
                Ok(())
            }
            Some(MessageType::Error) => {
                self.handle_error_message(message.payload()?);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn handle_sync(&mut self, payload: SyncPayload) -> Result<()> {
        if payload.is_request() {
            if let Some(remote) = payload.version_vector {
                let reply = SyncPayload {
                    operations: Some(self.crdt.document().missing_operations(&remote)),
                    document: None,
                    version_vector: Some(self.crdt.document().version_vector().clone()),
                };
                self.send_message(&RealtimeMessage::sync(self.site_id.as_str(), &reply)?)?;
            }
            return Ok(());
        }

        if let Some(snapshot) = payload.document {
            let remote = Document::from_snapshot(snapshot)?;
            let report = self.crdt.merge_document(&remote)?;
            debug!(applied = report.applied, skipped = report.skipped, "merged remote document");
            if report.applied > 0 {
                self.events
                    .emit(EngineEvent::ContentChanged(self.crdt.content().to_string()));
            }
        }

        if let Some(operations) = payload.operations {
            self.integrate_remote(operations)?;
        }

        if let Some(remote) = payload.version_vector {
            self.push_missing(&remote)?;
        }
        Ok(())
    }

    /// Send the peer operations it lacks that are not already on their way
    fn push_missing(&mut self, remote: &VersionVector) -> Result<()> {
        let queued: HashSet<_> = self
            .crdt
            .pending_operations()
            .chain(self.in_flight.iter().flat_map(|b| b.operations.iter()))
            .map(|op| op.id.clone())
            .collect();
        let missing: Vec<Operation> = self
            .crdt
            .document()
            .missing_operations(remote)
            .into_iter()
            .filter(|op| !queued.contains(&op.id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        debug!(operations = missing.len(), "pushing operations the peer lacks");
        let payload = SyncPayload {
            operations: Some(missing),
            ..SyncPayload::default()
        };
        self.send_message(&RealtimeMessage::sync(self.site_id.as_str(), &payload)?)?;
        Ok(())
    }

    /// Apply remote operations, then check each one that landed for
    /// conflicts against the local log
    fn integrate_remote(&mut self, operations: Vec<Operation>) -> Result<()> {
        let mut changed = false;
        let mut first_error = None;

        for op in operations {
            self.stats.operations_received += 1;
            match self.crdt.apply_remote_operation(op) {
                Ok(applied) => {
                    for entry in applied {
                        changed = true;
                        self.check_conflicts(&entry.operation);
                        self.events.emit(EngineEvent::RemoteOperationApplied {
                            operation: entry.operation,
                            effective: entry.effective,
                        });
                    }
                }
                Err(e) => {
                    warn!(site = %self.site_id, error = %e, "remote operation rejected");
                    first_error.get_or_insert(e);
                }
            }
        }

        if changed {
            self.events
                .emit(EngineEvent::ContentChanged(self.crdt.content().to_string()));
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_conflicts(&mut self, op: &Operation) {
        let results = self
            .resolver
            .process_operation(op, self.crdt.document().operations());
        for result in results {
            self.apply_resolution(result.resolved_operations);
        }
    }

    /// Resolved operations go through the idempotent remote path; those
    /// already in the log are no-ops
    fn apply_resolution(&mut self, operations: Vec<Operation>) {
        for op in operations {
            match self.crdt.apply_remote_operation(op) {
                Ok(applied) => {
                    for entry in applied {
                        self.events.emit(EngineEvent::RemoteOperationApplied {
                            operation: entry.operation,
                            effective: entry.effective,
                        });
                    }
                }
                Err(e) => warn!(error = %e, "resolved operation could not be applied"),
            }
        }
    }

    // Conflicts

    /// Resolve an active conflict with `strategy`, or the configured default
    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<ResolutionResult> {
        let result = match strategy {
            Some(strategy) => self.resolver.resolve_with(conflict_id, strategy),
            None => self.resolver.resolve(conflict_id),
        };
        if let Ok(result) = &result {
            if result.resolved {
                self.apply_resolution(result.resolved_operations.clone());
            }
        }
        self.drain_component_events();
        result
    }

    pub fn resolve_conflict_manually(
        &mut self,
        conflict_id: &str,
        chosen: Vec<Operation>,
    ) -> Result<ResolutionResult> {
        let result = self.resolver.resolve_manually(conflict_id, chosen);
        if let Ok(result) = &result {
            self.apply_resolution(result.resolved_operations.clone());
        }
        self.drain_component_events();
        result
    }

    pub fn dismiss_conflict(&mut self, conflict_id: &str) -> Result<ConflictInfo> {
        let dismissed = self.resolver.dismiss(conflict_id);
        self.drain_component_events();
        dismissed
    }

    // Presence

    pub fn update_presence(&mut self, updates: PresenceUpdate) -> Result<PresenceState> {
        let message = self.presence.update_presence(
            &self.config.user_id,
            &self.config.device_id,
            &self.config.user_name,
            updates,
        );
        self.publish_presence(message)?;
        self.own_presence()
    }

    pub fn update_cursor_position(&mut self, position: usize) -> Result<PresenceState> {
        let message = match self.presence.update_cursor_position(
            &self.config.user_id,
            &self.config.device_id,
            position,
        ) {
            Some(message) => message,
            None => self.presence.update_presence(
                &self.config.user_id,
                &self.config.device_id,
                &self.config.user_name,
                PresenceUpdate {
                    cursor_position: Some(position),
                    ..PresenceUpdate::default()
                },
            ),
        };
        self.publish_presence(message)?;
        self.own_presence()
    }

    pub fn update_selection_range(&mut self, range: Option<SelectionRange>) -> Result<PresenceState> {
        let message = match self.presence.update_selection_range(
            &self.config.user_id,
            &self.config.device_id,
            range,
        ) {
            Some(message) => message,
            None => self.presence.update_presence(
                &self.config.user_id,
                &self.config.device_id,
                &self.config.user_name,
                PresenceUpdate {
                    selection_range: range,
                    ..PresenceUpdate::default()
                },
            ),
        };
        self.publish_presence(message)?;
        self.own_presence()
    }

    /// Re-announce this device's presence without touching its activity time
    pub fn presence_heartbeat(&mut self) -> Result<()> {
        if let Some(own) = self.local_presence().cloned() {
            self.publish_presence(PresenceMessage::PresenceUpdate { presence: own })?;
        }
        Ok(())
    }

    /// Reclassify presence statuses and drop stale remote entries
    pub fn sweep_presence(&mut self) {
        self.presence.sweep();
        self.drain_component_events();
    }

    fn own_presence(&self) -> Result<PresenceState> {
        self.local_presence()
            .cloned()
            .ok_or_else(|| CoeditError::InvalidState("local presence missing".to_string()))
    }

    /// Presence is only worth sending live; a reconnect re-announces it
    fn publish_presence(&mut self, message: PresenceMessage) -> Result<()> {
        self.drain_component_events();
        if self.transport.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.send_message(&RealtimeMessage::presence(self.site_id.as_str(), &message)?)?;
        Ok(())
    }

    // State

    pub fn export_state(&self) -> Result<String> {
        let pending: Vec<Operation> = self
            .in_flight
            .iter()
            .flat_map(|batch| batch.operations.iter())
            .chain(self.crdt.pending_operations())
            .cloned()
            .collect();

        ExportedState::new(
            self.crdt.clock().clone(),
            self.crdt.document().snapshot(),
            pending,
            self.presences(),
        )
        .to_json()
    }

    fn emit_error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.events.emit(EngineEvent::Error {
            code: code.into(),
            message: message.into(),
        });
    }

    /// Re-emit conflict and presence events as engine events
    fn drain_component_events(&mut self) {
        while let Ok(event) = self.conflict_events.try_recv() {
            match event {
                ConflictEvent::Detected(conflict) => {
                    self.events.emit(EngineEvent::ConflictDetected(conflict))
                }
                ConflictEvent::Resolved { conflict, result } => self
                    .events
                    .emit(EngineEvent::ConflictResolved { conflict, result }),
                ConflictEvent::ResolutionFailed { conflict, error } => self.emit_error(
                    "resolution",
                    format!("conflict {} could not be resolved: {}", conflict.id, error),
                ),
                ConflictEvent::Dismissed(_) => {}
            }
        }
        while let Ok(event) = self.presence_events.try_recv() {
            self.events.emit(EngineEvent::PresenceUpdated(event));
        }
    }
}
