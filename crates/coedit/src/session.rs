/// Async session runtime
///
/// The engine lives in one task that owns it outright. Host commands,
/// transport frames and the periodic timers are all serialized through that
/// task's select loop.
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    CoeditError, ConflictInfo, DocumentSnapshot, EngineConfig, EngineEvent, FlushOutcome,
    Operation, PresenceState, PresenceUpdate, ResolutionResult, ResolutionStrategy, Result,
    SelectionRange, SyncEngine, SyncStats, Transport, TransportEvent, TransportHandle,
    WsTransport,
};

type Reply<T> = oneshot::Sender<T>;

pub enum EngineCommand {
    Insert {
        position: usize,
        text: String,
        reply: Reply<Result<Operation>>,
    },
    Delete {
        position: usize,
        length: usize,
        reply: Reply<Result<Operation>>,
    },
    Update {
        position: usize,
        text: String,
        properties: Option<Map<String, Value>>,
        reply: Reply<Result<Operation>>,
    },
    Format {
        position: usize,
        length: usize,
        properties: Map<String, Value>,
        reply: Reply<Result<Operation>>,
    },
    Move {
        position: usize,
        length: usize,
        target: usize,
        reply: Reply<Result<Operation>>,
    },
    Cursor {
        position: usize,
        reply: Reply<Result<PresenceState>>,
    },
    Selection {
        range: Option<SelectionRange>,
        reply: Reply<Result<PresenceState>>,
    },
    Presence {
        updates: PresenceUpdate,
        reply: Reply<Result<PresenceState>>,
    },
    Content(Reply<String>),
    Document(Reply<DocumentSnapshot>),
    Presences(Reply<Vec<PresenceState>>),
    Conflicts(Reply<Vec<ConflictInfo>>),
    ResolveConflict {
        conflict_id: String,
        strategy: Option<ResolutionStrategy>,
        reply: Reply<Result<ResolutionResult>>,
    },
    DismissConflict {
        conflict_id: String,
        reply: Reply<Result<ConflictInfo>>,
    },
    Stats(Reply<SyncStats>),
    Flush(Reply<FlushOutcome>),
    ExportState(Reply<Result<String>>),
    Subscribe(Reply<mpsc::UnboundedReceiver<EngineEvent>>),
    Shutdown(Reply<()>),
}

/// Cloneable handle for talking to a spawned engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    async fn request<R>(&self, build: impl FnOnce(Reply<R>) -> EngineCommand) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CoeditError::InvalidState("engine task has stopped".to_string()))?;
        rx.await
            .map_err(|_| CoeditError::InvalidState("engine task dropped the request".to_string()))
    }

    pub async fn insert_text(&self, position: usize, text: impl Into<String>) -> Result<Operation> {
        let text = text.into();
        self.request(|reply| EngineCommand::Insert {
            position,
            text,
            reply,
        })
        .await?
    }

    pub async fn delete_text(&self, position: usize, length: usize) -> Result<Operation> {
        self.request(|reply| EngineCommand::Delete {
            position,
            length,
            reply,
        })
        .await?
    }

    pub async fn update_text(
        &self,
        position: usize,
        text: impl Into<String>,
        properties: Option<Map<String, Value>>,
    ) -> Result<Operation> {
        let text = text.into();
        self.request(|reply| EngineCommand::Update {
            position,
            text,
            properties,
            reply,
        })
        .await?
    }

    pub async fn format_text(
        &self,
        position: usize,
        length: usize,
        properties: Map<String, Value>,
    ) -> Result<Operation> {
        self.request(|reply| EngineCommand::Format {
            position,
            length,
            properties,
            reply,
        })
        .await?
    }

    pub async fn move_text(&self, position: usize, length: usize, target: usize) -> Result<Operation> {
        self.request(|reply| EngineCommand::Move {
            position,
            length,
            target,
            reply,
        })
        .await?
    }

    pub async fn update_cursor_position(&self, position: usize) -> Result<PresenceState> {
        self.request(|reply| EngineCommand::Cursor { position, reply })
            .await?
    }

    pub async fn update_selection_range(
        &self,
        range: Option<SelectionRange>,
    ) -> Result<PresenceState> {
        self.request(|reply| EngineCommand::Selection { range, reply })
            .await?
    }

    pub async fn update_presence(&self, updates: PresenceUpdate) -> Result<PresenceState> {
        self.request(|reply| EngineCommand::Presence { updates, reply })
            .await?
    }

    pub async fn content(&self) -> Result<String> {
        self.request(EngineCommand::Content).await
    }

    pub async fn document(&self) -> Result<DocumentSnapshot> {
        self.request(EngineCommand::Document).await
    }

    pub async fn presences(&self) -> Result<Vec<PresenceState>> {
        self.request(EngineCommand::Presences).await
    }

    pub async fn active_conflicts(&self) -> Result<Vec<ConflictInfo>> {
        self.request(EngineCommand::Conflicts).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: impl Into<String>,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<ResolutionResult> {
        let conflict_id = conflict_id.into();
        self.request(|reply| EngineCommand::ResolveConflict {
            conflict_id,
            strategy,
            reply,
        })
        .await?
    }

    pub async fn dismiss_conflict(&self, conflict_id: impl Into<String>) -> Result<ConflictInfo> {
        let conflict_id = conflict_id.into();
        self.request(|reply| EngineCommand::DismissConflict { conflict_id, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<SyncStats> {
        self.request(EngineCommand::Stats).await
    }

    pub async fn flush(&self) -> Result<FlushOutcome> {
        self.request(EngineCommand::Flush).await
    }

    pub async fn export_state(&self) -> Result<String> {
        self.request(EngineCommand::ExportState).await?
    }

    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<EngineEvent>> {
        self.request(EngineCommand::Subscribe).await
    }

    /// Stop the engine task. Pending operations stay in the engine returned
    /// by the task's join handle.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(EngineCommand::Shutdown).await
    }
}

fn ticker(period_ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Run `engine` in its own task. `transport_events` feeds inbound frames and
/// connection changes into it.
///
/// The task ends on `shutdown` or when every handle is dropped, and hands
/// the engine back.
pub fn spawn_engine<T>(
    engine: SyncEngine<T>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> (EngineHandle, JoinHandle<SyncEngine<T>>)
where
    T: Transport + Send + 'static,
{
    let (commands, mut rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut engine = engine;
        let mut sync_timer = ticker(engine.config().sync.sync_interval_ms);
        let mut heartbeat = ticker(engine.config().presence.heartbeat_interval_ms);
        let mut sweep = ticker(engine.config().presence.cleanup_interval_ms);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(EngineCommand::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => handle_command(&mut engine, command),
                    None => break,
                },
                Some(event) = transport_events.recv() => {
                    if let Err(e) = engine.handle_transport_event(event) {
                        debug!(error = %e, "transport event not processed");
                    }
                }
                _ = sync_timer.tick() => {
                    engine.tick();
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = engine.presence_heartbeat() {
                        warn!(error = %e, "presence heartbeat failed");
                    }
                }
                _ = sweep.tick() => engine.sweep_presence(),
            }
        }

        info!(site = %engine.site_id(), "engine task stopped");
        engine
    });

    (EngineHandle { commands }, task)
}

fn handle_command<T: Transport>(engine: &mut SyncEngine<T>, command: EngineCommand) {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        EngineCommand::Insert {
            position,
            text,
            reply,
        } => {
            let _ = reply.send(engine.insert_text(position, &text));
        }
        EngineCommand::Delete {
            position,
            length,
            reply,
        } => {
            let _ = reply.send(engine.delete_text(position, length));
        }
        EngineCommand::Update {
            position,
            text,
            properties,
            reply,
        } => {
            let _ = reply.send(engine.update_text(position, &text, properties));
        }
        EngineCommand::Format {
            position,
            length,
            properties,
            reply,
        } => {
            let _ = reply.send(engine.format_text(position, length, properties));
        }
        EngineCommand::Move {
            position,
            length,
            target,
            reply,
        } => {
            let _ = reply.send(engine.move_text(position, length, target));
        }
        EngineCommand::Cursor { position, reply } => {
            let _ = reply.send(engine.update_cursor_position(position));
        }
        EngineCommand::Selection { range, reply } => {
            let _ = reply.send(engine.update_selection_range(range));
        }
        EngineCommand::Presence { updates, reply } => {
            let _ = reply.send(engine.update_presence(updates));
        }
        EngineCommand::Content(reply) => {
            let _ = reply.send(engine.content().to_string());
        }
        EngineCommand::Document(reply) => {
            let _ = reply.send(engine.document().snapshot());
        }
        EngineCommand::Presences(reply) => {
            let _ = reply.send(engine.presences());
        }
        EngineCommand::Conflicts(reply) => {
            let _ = reply.send(engine.active_conflicts().to_vec());
        }
        EngineCommand::ResolveConflict {
            conflict_id,
            strategy,
            reply,
        } => {
            let _ = reply.send(engine.resolve_conflict(&conflict_id, strategy));
        }
        EngineCommand::DismissConflict { conflict_id, reply } => {
            let _ = reply.send(engine.dismiss_conflict(&conflict_id));
        }
        EngineCommand::Stats(reply) => {
            let _ = reply.send(engine.stats());
        }
        EngineCommand::Flush(reply) => {
            let _ = reply.send(engine.flush());
        }
        EngineCommand::ExportState(reply) => {
            let _ = reply.send(engine.export_state());
        }
        EngineCommand::Subscribe(reply) => {
            let _ = reply.send(engine.subscribe());
        }
        EngineCommand::Shutdown(reply) => {
            let _ = reply.send(());
        }
    }
}

/// A connected editing session: engine task plus WebSocket transport
pub struct Session {
    handle: EngineHandle,
    transport: WsTransport,
    task: JoinHandle<SyncEngine<TransportHandle>>,
}

/// Start a session against `config.transport.url`
pub fn connect(config: EngineConfig) -> Result<Session> {
    config.validate()?;
    let (transport, events) = WsTransport::start(config.transport.clone());
    let engine = SyncEngine::new(config, transport.handle());
    info!(
        site = %engine.site_id(),
        document = %engine.config().document_id,
        "starting session"
    );

    let (handle, task) = spawn_engine(engine, events);
    Ok(Session {
        handle,
        transport,
        task,
    })
}

impl Session {
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the engine and close the socket. Returns the exported state so
    /// the host can persist unsent work.
    pub async fn close(self) -> Result<String> {
        self.handle.shutdown().await?;
        let engine = self
            .task
            .await
            .map_err(|e| CoeditError::InvalidState(format!("engine task failed: {}", e)))?;
        self.transport.close().await;
        engine.export_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionManager, RealtimeMessage, TransportConfig};

    fn engine() -> SyncEngine<ConnectionManager> {
        let mut config = EngineConfig::new("doc", "ada").with_site_id("a");
        config.sync.require_ack = false;
        SyncEngine::new(config, ConnectionManager::new(TransportConfig::default()))
    }

    #[tokio::test]
    async fn test_commands_are_served_in_order() {
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_engine(engine(), events_rx);

        handle.insert_text(0, "hello").await.unwrap();
        handle.insert_text(5, " world").await.unwrap();
        handle.delete_text(0, 1).await.unwrap();
        assert_eq!(handle.content().await.unwrap(), "ello world");

        let err = handle.delete_text(100, 1).await.unwrap_err();
        assert!(matches!(err, CoeditError::OutOfBounds { .. }));

        handle.shutdown().await.unwrap();
        let engine = task.await.unwrap();
        assert_eq!(engine.content(), "ello world");
    }

    #[tokio::test]
    async fn test_transport_frames_reach_the_engine() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_engine(engine(), events_rx);
        let mut events = handle.subscribe().await.unwrap();

        let mut remote = crate::CrdtEngine::new("b".into(), "doc", Default::default());
        let op = remote.insert_text(0, "hi").unwrap();
        let frame = serde_json::to_string(&RealtimeMessage::operation("b", &op).unwrap()).unwrap();
        events_tx.send(TransportEvent::Message(frame)).unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let EngineEvent::ContentChanged(content) = event {
                    return content;
                }
            }
            String::new()
        })
        .await
        .unwrap();
        assert_eq!(changed, "hi");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_the_task() {
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (handle, task) = spawn_engine(engine(), events_rx);
        drop(handle);
        let engine = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.content(), "");
    }
}
