/// User presence tracking for collaborative editing
/// Shows where users are working and their current selection
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::Subscribers;

/// Colours handed out to users for cursor/selection highlighting
const PALETTE: [&str; 12] = [
    "#E53935", "#8E24AA", "#3949AB", "#039BE5", "#00897B", "#7CB342", "#FDD835", "#FB8C00",
    "#6D4C41", "#D81B60", "#5E35B1", "#00ACC1",
];

/// Deterministic colour for a user id
pub fn color_for_user(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
    PALETTE[hash as usize % PALETTE.len()].to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: usize,
    pub end: usize,
}

/// One device's presence in a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: String,
    pub device_id: String,
    pub user_name: String,
    pub user_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_range: Option<SelectionRange>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl PresenceState {
    pub fn key(&self) -> PresenceKey {
        PresenceKey::new(self.user_id.clone(), self.device_id.clone())
    }

    /// Milliseconds since the last activity, as seen at `now`
    pub fn idle_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.last_activity).num_milliseconds().max(0) as u64
    }
}

/// Optional fields to change in an existing presence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_range: Option<SelectionRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PresenceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceKey {
    pub user_id: String,
    pub device_id: String,
}

impl PresenceKey {
    pub fn new(user_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl std::fmt::Display for PresenceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_away_timeout_ms")]
    pub away_timeout_ms: u64,
    #[serde(default = "default_max_presences")]
    pub max_presences_per_document: usize,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_away_timeout_ms() -> u64 {
    300_000
}

fn default_max_presences() -> usize {
    50
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            away_timeout_ms: default_away_timeout_ms(),
            max_presences_per_document: default_max_presences(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl PresenceConfig {
    /// Inactivity after which an entry is removed outright
    pub fn stale_after_ms(&self) -> u64 {
        self.away_timeout_ms.saturating_mul(2)
    }

    pub fn classify(&self, idle_ms: u64) -> PresenceStatus {
        if idle_ms <= self.idle_timeout_ms {
            PresenceStatus::Active
        } else if idle_ms <= self.away_timeout_ms {
            PresenceStatus::Idle
        } else {
            PresenceStatus::Away
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Left,
    Stale,
    Evicted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    Updated(PresenceState),
    StatusChanged {
        key: PresenceKey,
        from: PresenceStatus,
        to: PresenceStatus,
    },
    Removed {
        presence: PresenceState,
        reason: RemovalReason,
    },
}

/// Presence tracker holds every device's presence in one document
#[derive(Debug, Default)]
pub struct PresenceTracker {
    config: PresenceConfig,
    presences: BTreeMap<PresenceKey, PresenceState>,
    /// Never evicted or swept
    pinned: Option<PresenceKey>,
    events: Subscribers<PresenceEvent>,
}

impl PresenceTracker {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            presences: BTreeMap::new(),
            pinned: None,
            events: Subscribers::new(),
        }
    }

    /// Exempt `key` (normally this site's own entry) from eviction and
    /// stale cleanup
    pub fn pin(&mut self, key: PresenceKey) {
        self.pinned = Some(key);
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<PresenceEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, user_id: &str, device_id: &str) -> Option<&PresenceState> {
        self.presences.get(&PresenceKey::new(user_id, device_id))
    }

    /// All presences, ordered by `(userId, deviceId)`
    pub fn presences(&self) -> Vec<PresenceState> {
        self.presences.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.presences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presences.is_empty()
    }

    pub fn update_presence(
        &mut self,
        user_id: &str,
        device_id: &str,
        user_name: &str,
        updates: PresenceUpdate,
    ) -> PresenceState {
        self.update_presence_at(user_id, device_id, user_name, updates, Utc::now())
    }

    /// Upsert a presence and refresh its activity time
    pub fn update_presence_at(
        &mut self,
        user_id: &str,
        device_id: &str,
        user_name: &str,
        updates: PresenceUpdate,
        now: DateTime<Utc>,
    ) -> PresenceState {
        let key = PresenceKey::new(user_id, device_id);
        if !self.presences.contains_key(&key) {
            self.make_room(now);
        }

        let state = self
            .presences
            .entry(key)
            .or_insert_with(|| PresenceState {
                user_id: user_id.to_string(),
                device_id: device_id.to_string(),
                user_name: user_name.to_string(),
                user_color: color_for_user(user_id),
                cursor_position: None,
                selection_range: None,
                last_activity: now,
                status: PresenceStatus::Active,
            });

        state.user_name = user_name.to_string();
        if let Some(color) = updates.user_color {
            state.user_color = color;
        }
        if let Some(position) = updates.cursor_position {
            state.cursor_position = Some(position);
        }
        if let Some(range) = updates.selection_range {
            state.selection_range = Some(range);
        }
        state.status = updates.status.unwrap_or(PresenceStatus::Active);
        state.last_activity = now;

        let state = state.clone();
        self.events.emit(PresenceEvent::Updated(state.clone()));
        state
    }

    pub fn update_cursor_position(
        &mut self,
        user_id: &str,
        device_id: &str,
        position: usize,
    ) -> Option<PresenceState> {
        self.update_cursor_position_at(user_id, device_id, position, Utc::now())
    }

    pub fn update_cursor_position_at(
        &mut self,
        user_id: &str,
        device_id: &str,
        position: usize,
        now: DateTime<Utc>,
    ) -> Option<PresenceState> {
        self.touch(user_id, device_id, now, |state| {
            state.cursor_position = Some(position)
        })
    }

    pub fn update_selection_range(
        &mut self,
        user_id: &str,
        device_id: &str,
        range: Option<SelectionRange>,
    ) -> Option<PresenceState> {
        self.update_selection_range_at(user_id, device_id, range, Utc::now())
    }

    /// Set or clear (`None`) the selection
    pub fn update_selection_range_at(
        &mut self,
        user_id: &str,
        device_id: &str,
        range: Option<SelectionRange>,
        now: DateTime<Utc>,
    ) -> Option<PresenceState> {
        self.touch(user_id, device_id, now, |state| state.selection_range = range)
    }

    fn touch(
        &mut self,
        user_id: &str,
        device_id: &str,
        now: DateTime<Utc>,
        change: impl FnOnce(&mut PresenceState),
    ) -> Option<PresenceState> {
        let state = self.presences.get_mut(&PresenceKey::new(user_id, device_id))?;
        change(state);
        state.status = PresenceStatus::Active;
        state.last_activity = now;

        let state = state.clone();
        self.events.emit(PresenceEvent::Updated(state.clone()));
        Some(state)
    }

    /// Replace an entry with the state its owning site reported
    pub fn apply_remote(&mut self, state: PresenceState) {
        let key = state.key();
        if !self.presences.contains_key(&key) {
            self.make_room(Utc::now());
        }
        self.presences.insert(key, state.clone());
        self.events.emit(PresenceEvent::Updated(state));
    }

    /// Replace every entry except `keep` with a remote snapshot
    pub fn replace_remote(&mut self, snapshot: Vec<PresenceState>, keep: Option<&PresenceKey>) {
        self.presences.retain(|key, _| Some(key) == keep);
        for state in snapshot {
            if Some(&state.key()) == keep {
                continue;
            }
            self.apply_remote(state);
        }
    }

    pub fn remove_presence(&mut self, user_id: &str, device_id: &str) -> Option<PresenceState> {
        let removed = self
            .presences
            .remove(&PresenceKey::new(user_id, device_id))?;
        self.events.emit(PresenceEvent::Removed {
            presence: removed.clone(),
            reason: RemovalReason::Left,
        });
        Some(removed)
    }

    pub fn recompute_statuses(&mut self) -> Vec<PresenceEvent> {
        self.recompute_statuses_at(Utc::now())
    }

    /// Reclassify every entry by inactivity. Offline entries are left alone.
    pub fn recompute_statuses_at(&mut self, now: DateTime<Utc>) -> Vec<PresenceEvent> {
        let mut changes = Vec::new();
        for (key, state) in self.presences.iter_mut() {
            if state.status == PresenceStatus::Offline {
                continue;
            }
            let status = self.config.classify(state.idle_ms(now));
            if status != state.status {
                changes.push(PresenceEvent::StatusChanged {
                    key: key.clone(),
                    from: state.status,
                    to: status,
                });
                state.status = status;
            }
        }
        for change in &changes {
            self.events.emit(change.clone());
        }
        changes
    }

    pub fn cleanup_stale(&mut self) -> Vec<PresenceState> {
        self.cleanup_stale_at(Utc::now())
    }

    /// Remove entries inactive for more than twice the away timeout
    pub fn cleanup_stale_at(&mut self, now: DateTime<Utc>) -> Vec<PresenceState> {
        let limit = self.config.stale_after_ms();
        let stale: Vec<PresenceKey> = self
            .presences
            .iter()
            .filter(|(key, state)| Some(*key) != self.pinned.as_ref() && state.idle_ms(now) > limit)
            .map(|(key, _)| key.clone())
            .collect();

        self.remove_all(stale, RemovalReason::Stale)
    }

    /// Free a slot for a new entry: stale entries go first, then the
    /// least recently active one
    fn make_room(&mut self, now: DateTime<Utc>) {
        let max = self.config.max_presences_per_document;
        if self.presences.len() < max {
            return;
        }

        self.cleanup_stale_at(now);

        while self.presences.len() >= max && !self.presences.is_empty() {
            let oldest = self
                .presences
                .iter()
                .filter(|(key, _)| Some(*key) != self.pinned.as_ref())
                .min_by_key(|(_, state)| state.last_activity)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    debug!(presence = %key, "evicting least recently active presence");
                    self.remove_all(vec![key], RemovalReason::Evicted);
                }
                None => break,
            }
        }
    }

    fn remove_all(&mut self, keys: Vec<PresenceKey>, reason: RemovalReason) -> Vec<PresenceState> {
        let mut removed = Vec::new();
        for key in keys {
            if let Some(state) = self.presences.remove(&key) {
                self.events.emit(PresenceEvent::Removed {
                    presence: state.clone(),
                    reason,
                });
                removed.push(state);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tracker(max: usize) -> PresenceTracker {
        PresenceTracker::new(PresenceConfig {
            idle_timeout_ms: 1_000,
            away_timeout_ms: 5_000,
            max_presences_per_document: max,
            ..PresenceConfig::default()
        })
    }

    #[test]
    fn test_user_color_is_deterministic() {
        let color = color_for_user("alice");
        assert_eq!(color, color_for_user("alice"));
        assert!(color.starts_with('#'));
        assert_eq!(color.len(), 7);
    }

    #[test]
    fn test_update_and_partial_updates() {
        let mut t = tracker(10);
        let t0 = Utc::now();
        t.update_presence_at("alice", "laptop", "Alice", PresenceUpdate::default(), t0);

        let later = t0 + Duration::milliseconds(500);
        let state = t
            .update_cursor_position_at("alice", "laptop", 42, later)
            .unwrap();
        assert_eq!(state.cursor_position, Some(42));
        assert_eq!(state.last_activity, later);

        let range = SelectionRange { start: 3, end: 9 };
        t.update_selection_range_at("alice", "laptop", Some(range), later);
        assert_eq!(
            t.get("alice", "laptop").unwrap().selection_range,
            Some(range)
        );

        // Partial updates for unknown devices are ignored
        assert!(t.update_cursor_position("bob", "phone", 1).is_none());
    }

    #[test]
    fn test_one_entry_per_device() {
        let mut t = tracker(10);
        t.update_presence("alice", "laptop", "Alice", PresenceUpdate::default());
        t.update_presence("alice", "phone", "Alice", PresenceUpdate::default());
        t.update_presence("alice", "laptop", "Alice", PresenceUpdate::default());

        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_eviction_removes_least_recently_active() {
        let mut t = tracker(3);
        let t0 = Utc::now();
        for (i, user) in ["u0", "u1", "u2", "u3"].iter().enumerate() {
            t.update_presence_at(
                user,
                "d",
                user,
                PresenceUpdate::default(),
                t0 + Duration::milliseconds(i as i64 * 10),
            );
        }

        assert_eq!(t.len(), 3);
        assert!(t.get("u0", "d").is_none());
        assert!(t.get("u3", "d").is_some());
    }

    #[test]
    fn test_stale_entries_evicted_first() {
        let mut t = tracker(2);
        let t0 = Utc::now();
        t.update_presence_at("old", "d", "Old", PresenceUpdate::default(), t0);
        t.update_presence_at(
            "fresh",
            "d",
            "Fresh",
            PresenceUpdate::default(),
            t0 + Duration::milliseconds(11_000),
        );
        t.update_presence_at(
            "new",
            "d",
            "New",
            PresenceUpdate::default(),
            t0 + Duration::milliseconds(11_500),
        );

        assert!(t.get("old", "d").is_none());
        assert!(t.get("fresh", "d").is_some());
        assert!(t.get("new", "d").is_some());
    }

    #[test]
    fn test_status_transitions() {
        let mut t = tracker(10);
        let mut events = t.subscribe();
        let t0 = Utc::now();
        t.update_presence_at("alice", "d", "Alice", PresenceUpdate::default(), t0);
        let _ = events.try_recv();

        assert!(t.recompute_statuses_at(t0 + Duration::milliseconds(900)).is_empty());

        let changes = t.recompute_statuses_at(t0 + Duration::milliseconds(2_000));
        assert_eq!(changes.len(), 1);
        assert_eq!(t.get("alice", "d").unwrap().status, PresenceStatus::Idle);
        assert!(matches!(
            events.try_recv().unwrap(),
            PresenceEvent::StatusChanged {
                to: PresenceStatus::Idle,
                ..
            }
        ));

        t.recompute_statuses_at(t0 + Duration::milliseconds(6_000));
        assert_eq!(t.get("alice", "d").unwrap().status, PresenceStatus::Away);
    }

    #[test]
    fn test_cleanup_stale() {
        let mut t = tracker(10);
        let t0 = Utc::now();
        t.update_presence_at("alice", "d", "Alice", PresenceUpdate::default(), t0);
        t.update_presence_at(
            "bob",
            "d",
            "Bob",
            PresenceUpdate::default(),
            t0 + Duration::milliseconds(8_000),
        );

        let removed = t.cleanup_stale_at(t0 + Duration::milliseconds(10_500));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].user_id, "alice");
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_remote_snapshot_keeps_local_entry() {
        let mut t = tracker(10);
        let local = t.update_presence("me", "d", "Me", PresenceUpdate::default());
        t.update_presence("gone", "d", "Gone", PresenceUpdate::default());

        let mut remote = local.clone();
        remote.user_id = "peer".to_string();
        t.replace_remote(vec![remote], Some(&local.key()));

        assert_eq!(t.len(), 2);
        assert!(t.get("gone", "d").is_none());
        assert!(t.get("peer", "d").is_some());
    }

    #[test]
    fn test_pinned_entry_survives_eviction_and_sweep() {
        let mut t = tracker(2);
        let t0 = Utc::now();
        t.update_presence_at("me", "d", "Me", PresenceUpdate::default(), t0);
        t.pin(PresenceKey::new("me", "d"));

        t.update_presence_at("a", "d", "A", PresenceUpdate::default(), t0 + Duration::seconds(1));
        t.update_presence_at("b", "d", "B", PresenceUpdate::default(), t0 + Duration::seconds(2));
        assert_eq!(t.len(), 2);
        assert!(t.get("me", "d").is_some());
        assert!(t.get("a", "d").is_none());

        let removed = t.cleanup_stale_at(t0 + Duration::hours(1));
        assert_eq!(removed.len(), 1);
        assert!(t.get("me", "d").is_some());
    }
}
