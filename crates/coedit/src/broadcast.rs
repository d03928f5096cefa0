/// Presence broadcaster: a presence tracker plus the connections it fans out to
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    PresenceConfig, PresenceEvent, PresenceKey, PresenceState, PresenceTracker, PresenceUpdate,
    RealtimeMessage, SelectionRange,
};

/// Presence payload carried inside `presence` envelopes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PresenceMessage {
    /// Full snapshot of every presence in the document
    PresenceSync { presences: Vec<PresenceState> },
    PresenceUpdate { presence: PresenceState },
    CursorUpdate { presence: PresenceState },
    SelectionUpdate { presence: PresenceState },
    #[serde(rename_all = "camelCase")]
    PresenceLeave { user_id: String, device_id: String },
}

impl PresenceMessage {
    /// Device the message is about; snapshots have none
    pub fn origin(&self) -> Option<PresenceKey> {
        match self {
            PresenceMessage::PresenceSync { .. } => None,
            PresenceMessage::PresenceUpdate { presence }
            | PresenceMessage::CursorUpdate { presence }
            | PresenceMessage::SelectionUpdate { presence } => Some(presence.key()),
            PresenceMessage::PresenceLeave { user_id, device_id } => {
                Some(PresenceKey::new(user_id.clone(), device_id.clone()))
            }
        }
    }
}

struct Connection {
    key: PresenceKey,
    outbound: mpsc::UnboundedSender<String>,
}

pub struct PresenceBroadcaster {
    sender_id: String,
    tracker: PresenceTracker,
    connections: HashMap<String, Connection>,
    max_message_size: usize,
}

impl PresenceBroadcaster {
    pub fn new(sender_id: impl Into<String>, config: PresenceConfig, max_message_size: usize) -> Self {
        Self {
            sender_id: sender_id.into(),
            tracker: PresenceTracker::new(config),
            connections: HashMap::new(),
            max_message_size,
        }
    }

    pub fn tracker(&self) -> &PresenceTracker {
        &self.tracker
    }

    /// Keep this site's own presence through eviction and sweeps
    pub fn pin_presence(&mut self, key: PresenceKey) {
        self.tracker.pin(key);
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<PresenceEvent> {
        self.tracker.subscribe()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Register a connection: it receives a full snapshot, everyone else
    /// hears about the new presence.
    pub fn register_connection(
        &mut self,
        connection_id: impl Into<String>,
        user_id: &str,
        device_id: &str,
        user_name: &str,
        outbound: mpsc::UnboundedSender<String>,
    ) -> PresenceState {
        let state =
            self.tracker
                .update_presence(user_id, device_id, user_name, PresenceUpdate::default());
        let connection_id = connection_id.into();
        self.connections.insert(
            connection_id.clone(),
            Connection {
                key: state.key(),
                outbound,
            },
        );

        let snapshot = PresenceMessage::PresenceSync {
            presences: self.tracker.presences(),
        };
        if let Some(frame) = self.frame(&snapshot) {
            self.send_to(&connection_id, frame);
        }

        self.fan_out(
            &PresenceMessage::PresenceUpdate {
                presence: state.clone(),
            },
            Some(&state.key()),
        );
        debug!(connection = %connection_id, presence = %state.key(), "presence connection registered");
        state
    }

    /// Drop a connection. The presence is removed once no other connection
    /// shares its device key.
    pub fn unregister_connection(&mut self, connection_id: &str) -> Option<PresenceState> {
        let connection = self.connections.remove(connection_id)?;
        if self.connections.values().any(|c| c.key == connection.key) {
            return None;
        }

        let removed = self
            .tracker
            .remove_presence(&connection.key.user_id, &connection.key.device_id)?;
        self.fan_out(
            &PresenceMessage::PresenceLeave {
                user_id: removed.user_id.clone(),
                device_id: removed.device_id.clone(),
            },
            None,
        );
        Some(removed)
    }

    pub fn update_presence(
        &mut self,
        user_id: &str,
        device_id: &str,
        user_name: &str,
        updates: PresenceUpdate,
    ) -> PresenceMessage {
        let presence = self
            .tracker
            .update_presence(user_id, device_id, user_name, updates);
        let message = PresenceMessage::PresenceUpdate { presence };
        self.fan_out(&message, message.origin().as_ref());
        message
    }

    pub fn update_cursor_position(
        &mut self,
        user_id: &str,
        device_id: &str,
        position: usize,
    ) -> Option<PresenceMessage> {
        let presence = self
            .tracker
            .update_cursor_position(user_id, device_id, position)?;
        let message = PresenceMessage::CursorUpdate { presence };
        self.fan_out(&message, message.origin().as_ref());
        Some(message)
    }

    pub fn update_selection_range(
        &mut self,
        user_id: &str,
        device_id: &str,
        range: Option<SelectionRange>,
    ) -> Option<PresenceMessage> {
        let presence = self
            .tracker
            .update_selection_range(user_id, device_id, range)?;
        let message = PresenceMessage::SelectionUpdate { presence };
        self.fan_out(&message, message.origin().as_ref());
        Some(message)
    }

    /// Fold a presence message from the network into the tracker. The
    /// message is its own fan-out, so nothing is re-broadcast.
    ///
    /// `local` is this site's own device; a remote snapshot never
    /// overwrites it.
    pub fn apply_remote(&mut self, message: PresenceMessage, local: Option<&PresenceKey>) {
        match message {
            PresenceMessage::PresenceSync { presences } => {
                self.tracker.replace_remote(presences, local)
            }
            PresenceMessage::PresenceUpdate { presence }
            | PresenceMessage::CursorUpdate { presence }
            | PresenceMessage::SelectionUpdate { presence } => {
                if Some(&presence.key()) != local {
                    self.tracker.apply_remote(presence);
                }
            }
            PresenceMessage::PresenceLeave { user_id, device_id } => {
                self.tracker.remove_presence(&user_id, &device_id);
            }
        }
    }

    /// Snapshot of every presence, sent to all connections
    pub fn heartbeat(&mut self) -> PresenceMessage {
        let message = PresenceMessage::PresenceSync {
            presences: self.tracker.presences(),
        };
        self.fan_out(&message, None);
        message
    }

    /// Periodic maintenance: reclassify statuses and drop stale entries.
    /// Returns `presence-leave` messages for the dropped ones.
    pub fn sweep_at(&mut self, now: DateTime<Utc>) -> Vec<PresenceMessage> {
        self.tracker.recompute_statuses_at(now);
        let leaves: Vec<PresenceMessage> = self
            .tracker
            .cleanup_stale_at(now)
            .into_iter()
            .map(|state| PresenceMessage::PresenceLeave {
                user_id: state.user_id,
                device_id: state.device_id,
            })
            .collect();
        for leave in &leaves {
            self.fan_out(leave, None);
        }
        leaves
    }

    pub fn sweep(&mut self) -> Vec<PresenceMessage> {
        self.sweep_at(Utc::now())
    }

    /// Send `message` to every connection except those of `exclude`.
    /// Returns how many connections it reached.
    pub fn fan_out(&mut self, message: &PresenceMessage, exclude: Option<&PresenceKey>) -> usize {
        if self.connections.is_empty() {
            return 0;
        }
        let Some(frame) = self.frame(message) else {
            return 0;
        };

        let mut closed = Vec::new();
        let mut reached = 0;
        for (id, connection) in &self.connections {
            if Some(&connection.key) == exclude {
                continue;
            }
            if connection.outbound.send(frame.clone()).is_ok() {
                reached += 1;
            } else {
                closed.push(id.clone());
            }
        }
        for id in closed {
            self.connections.remove(&id);
        }
        reached
    }

    fn send_to(&mut self, connection_id: &str, frame: String) {
        let closed = match self.connections.get(connection_id) {
            Some(connection) => connection.outbound.send(frame).is_err(),
            None => false,
        };
        if closed {
            self.connections.remove(connection_id);
        }
    }

    /// Encode a presence envelope, dropping it if it is over the size limit
    fn frame(&self, message: &PresenceMessage) -> Option<String> {
        let encoded = RealtimeMessage::presence(self.sender_id.clone(), message)
            .and_then(|envelope| Ok(serde_json::to_string(&envelope)?));
        match encoded {
            Ok(frame) if frame.len() <= self.max_message_size => Some(frame),
            Ok(frame) => {
                warn!(
                    size = frame.len(),
                    max = self.max_message_size,
                    "presence message too large, not broadcasting"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to encode presence message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PresencePayload;

    fn broadcaster() -> PresenceBroadcaster {
        PresenceBroadcaster::new("relay", PresenceConfig::default(), 1024 * 1024)
    }

    fn decode(frame: &str) -> PresenceMessage {
        let envelope: RealtimeMessage = serde_json::from_str(frame).unwrap();
        assert_eq!(envelope.message_type, "presence");
        envelope.payload::<PresencePayload>().unwrap().presence
    }

    #[test]
    fn test_register_sends_snapshot_and_notifies_others() {
        let mut b = broadcaster();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        b.register_connection("c1", "alice", "laptop", "Alice", tx1);
        assert!(matches!(
            decode(&rx1.try_recv().unwrap()),
            PresenceMessage::PresenceSync { presences } if presences.len() == 1
        ));

        b.register_connection("c2", "bob", "phone", "Bob", tx2);
        assert!(matches!(
            decode(&rx2.try_recv().unwrap()),
            PresenceMessage::PresenceSync { presences } if presences.len() == 2
        ));
        assert!(matches!(
            decode(&rx1.try_recv().unwrap()),
            PresenceMessage::PresenceUpdate { presence } if presence.user_id == "bob"
        ));
        // The newcomer does not hear about itself
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_updates_exclude_sender() {
        let mut b = broadcaster();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        b.register_connection("c1", "alice", "laptop", "Alice", tx1);
        b.register_connection("c2", "bob", "phone", "Bob", tx2);
        while rx1.try_recv().is_ok() {}
        while rx2.try_recv().is_ok() {}

        b.update_cursor_position("alice", "laptop", 12).unwrap();

        assert!(rx1.try_recv().is_err());
        assert!(matches!(
            decode(&rx2.try_recv().unwrap()),
            PresenceMessage::CursorUpdate { presence } if presence.cursor_position == Some(12)
        ));
    }

    #[test]
    fn test_unregister_broadcasts_leave() {
        let mut b = broadcaster();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        b.register_connection("c1", "alice", "laptop", "Alice", tx1);
        b.register_connection("c2", "bob", "phone", "Bob", tx2);
        while rx2.try_recv().is_ok() {}
        drop(rx1);

        let removed = b.unregister_connection("c1").unwrap();
        assert_eq!(removed.user_id, "alice");
        assert_eq!(b.tracker().len(), 1);
        assert!(matches!(
            decode(&rx2.try_recv().unwrap()),
            PresenceMessage::PresenceLeave { user_id, .. } if user_id == "alice"
        ));
    }

    #[test]
    fn test_oversized_messages_are_dropped() {
        let mut b = PresenceBroadcaster::new("relay", PresenceConfig::default(), 32);
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_connection("c1", "alice", "laptop", "Alice", tx);

        assert!(rx.try_recv().is_err());
        assert_eq!(b.heartbeat_reach(), 0);
    }

    #[test]
    fn test_apply_remote_does_not_fan_out() {
        let mut b = broadcaster();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.register_connection("c1", "alice", "laptop", "Alice", tx);
        while rx.try_recv().is_ok() {}

        let mut remote = b.tracker().get("alice", "laptop").unwrap().clone();
        remote.user_id = "carol".to_string();
        b.apply_remote(PresenceMessage::PresenceUpdate { presence: remote }, None);

        assert_eq!(b.tracker().len(), 2);
        assert!(rx.try_recv().is_err());
    }

    impl PresenceBroadcaster {
        fn heartbeat_reach(&mut self) -> usize {
            let message = PresenceMessage::PresenceSync {
                presences: self.tracker.presences(),
            };
            self.fan_out(&message, None)
        }
    }
}
