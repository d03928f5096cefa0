/// Connection state machine for the message transport
///
/// `ConnectionManager` holds no socket. It decides what happens on open,
/// close and send; the WebSocket driver in `ws` performs the I/O.
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::default_max_message_size;
use crate::{CoeditError, Result, Subscribers};

/// Close code for a deliberate, clean shutdown
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Frames held while disconnected
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Handshake budget; an expired attempt counts as an abnormal close
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Budget for writing one frame to the socket
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

fn default_url() -> String {
    "ws://127.0.0.1:9300/default".to_string()
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_max_queue_size() -> usize {
    1_000
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            auto_reconnect: default_auto_reconnect(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_queue_size: default_max_queue_size(),
            max_message_size: default_max_message_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl TransportConfig {
    /// Delay before reconnect attempt number `attempt` (0-based):
    /// `base * 1.5^attempt`, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self.reconnect_delay_ms as f64 * 1.5f64.powi(attempt as i32);
        let capped = delay.min(self.max_reconnect_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected,
    Disconnected {
        code: u16,
        reason: String,
    },
    ReconnectScheduled {
        attempt: u32,
        delay_ms: u64,
    },
    /// Reconnect budget exhausted; no further attempts
    ReconnectFailed {
        attempts: u32,
    },
    Message(String),
    Error(String),
}

/// What the driver should do after a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Reconnect { delay: Duration, attempt: u32 },
    GiveUp,
    Stay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Held until the next successful open
    Queued,
}

/// Outbound side of a transport as seen by the sync engine
pub trait Transport {
    fn send(&mut self, frame: String) -> Result<SendOutcome>;
    fn state(&self) -> ConnectionState;
}

pub struct ConnectionManager {
    config: TransportConfig,
    state: ConnectionState,
    attempts: u32,
    queue: VecDeque<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    events: Subscribers<TransportEvent>,
}

impl ConnectionManager {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            attempts: 0,
            queue: VecDeque::new(),
            outbound: None,
            events: Subscribers::new(),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn set_state(&mut self, to: ConnectionState) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(?from, ?to, "transport state changed");
        self.events.emit(TransportEvent::StateChanged { from, to });
    }

    /// Begin connecting. Returns false (and does nothing) when a connection
    /// is already open or in progress.
    pub fn connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Reconnecting => false,
            _ => {
                self.set_state(ConnectionState::Connecting);
                true
            }
        }
    }

    /// A scheduled reconnect is starting its attempt
    pub fn begin_reconnect(&mut self) {
        if self.state == ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// The socket opened: reset the backoff and flush held frames.
    /// Returns how many queued frames were flushed.
    pub fn on_open(&mut self, outbound: mpsc::UnboundedSender<String>) -> usize {
        self.attempts = 0;
        self.set_state(ConnectionState::Connected);

        let mut flushed = 0;
        while let Some(frame) = self.queue.pop_front() {
            if let Err(unsent) = outbound.send(frame) {
                self.queue.push_front(unsent.0);
                break;
            }
            flushed += 1;
        }
        self.outbound = Some(outbound);

        info!(flushed, "transport connected");
        self.events.emit(TransportEvent::Connected);
        flushed
    }

    pub fn on_message(&mut self, frame: String) {
        self.events.emit(TransportEvent::Message(frame));
    }

    pub fn on_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        warn!(%error, "transport error");
        self.events.emit(TransportEvent::Error(error));
    }

    /// The connection closed (or never opened). Applies the reconnect policy.
    pub fn on_close(&mut self, code: u16, reason: &str) -> CloseAction {
        self.outbound = None;

        if self.state == ConnectionState::Closed {
            return CloseAction::Stay;
        }
        self.events.emit(TransportEvent::Disconnected {
            code,
            reason: reason.to_string(),
        });

        if code == NORMAL_CLOSURE || !self.config.auto_reconnect {
            self.set_state(ConnectionState::Disconnected);
            return CloseAction::Stay;
        }

        if self.attempts >= self.config.max_reconnect_attempts {
            warn!(attempts = self.attempts, "giving up on reconnecting");
            self.set_state(ConnectionState::Error);
            self.events.emit(TransportEvent::ReconnectFailed {
                attempts: self.attempts,
            });
            return CloseAction::GiveUp;
        }

        let delay = self.config.backoff_delay(self.attempts);
        self.attempts += 1;
        self.set_state(ConnectionState::Reconnecting);
        info!(
            attempt = self.attempts,
            delay_ms = delay.as_millis() as u64,
            code,
            reason,
            "connection lost, scheduling reconnect"
        );
        self.events.emit(TransportEvent::ReconnectScheduled {
            attempt: self.attempts,
            delay_ms: delay.as_millis() as u64,
        });
        CloseAction::Reconnect {
            delay,
            attempt: self.attempts,
        }
    }

    /// Put frames the socket never wrote back at the head of the queue
    pub fn requeue_front(&mut self, frames: Vec<String>) {
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame);
        }
    }

    /// Deliberate shutdown: stops reconnecting and keeps queued frames
    pub fn disconnect(&mut self) {
        self.outbound = None;
        self.set_state(ConnectionState::Closed);
    }

    fn enqueue(&mut self, frame: String) -> Result<SendOutcome> {
        if self.queue.len() >= self.config.max_queue_size {
            return Err(CoeditError::QueueFull(self.config.max_queue_size));
        }
        self.queue.push_back(frame);
        Ok(SendOutcome::Queued)
    }
}

impl Transport for ConnectionManager {
    fn send(&mut self, frame: String) -> Result<SendOutcome> {
        if frame.len() > self.config.max_message_size {
            return Err(CoeditError::MessageTooLarge {
                size: frame.len(),
                max: self.config.max_message_size,
            });
        }

        if self.state == ConnectionState::Connected {
            if let Some(outbound) = &self.outbound {
                match outbound.send(frame) {
                    Ok(()) => return Ok(SendOutcome::Sent),
                    Err(unsent) => return self.enqueue(unsent.0),
                }
            }
        }
        self.enqueue(frame)
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_attempts: u32, max_delay_ms: u64) -> ConnectionManager {
        ConnectionManager::new(TransportConfig {
            max_reconnect_attempts: max_attempts,
            reconnect_delay_ms: 1_000,
            max_reconnect_delay_ms: max_delay_ms,
            max_queue_size: 3,
            ..TransportConfig::default()
        })
    }

    #[test]
    fn test_connect_is_noop_when_connecting_or_connected() {
        let mut m = manager(5, 30_000);
        assert!(m.connect());
        assert!(!m.connect());

        let (tx, _rx) = mpsc::unbounded_channel();
        m.on_open(tx);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert!(!m.connect());
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let mut m = manager(5, 3_000);
        m.connect();

        let mut delays = Vec::new();
        for _ in 0..3 {
            match m.on_close(ABNORMAL_CLOSURE, "dropped") {
                CloseAction::Reconnect { delay, .. } => delays.push(delay),
                other => panic!("expected reconnect, got {:?}", other),
            }
            m.begin_reconnect();
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(1_500),
                Duration::from_millis(2_250)
            ]
        );
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));

        for _ in 0..2 {
            match m.on_close(ABNORMAL_CLOSURE, "dropped") {
                CloseAction::Reconnect { delay, .. } => {
                    assert_eq!(delay, Duration::from_millis(3_000))
                }
                other => panic!("expected reconnect, got {:?}", other),
            }
            m.begin_reconnect();
        }

        // Budget of 5 spent
        assert_eq!(m.on_close(ABNORMAL_CLOSURE, "dropped"), CloseAction::GiveUp);
        assert_eq!(m.state(), ConnectionState::Error);
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut m = manager(5, 30_000);
        m.connect();
        m.on_close(ABNORMAL_CLOSURE, "dropped");
        m.on_close(ABNORMAL_CLOSURE, "dropped");
        assert_eq!(m.attempts(), 2);

        let (tx, _rx) = mpsc::unbounded_channel();
        m.on_open(tx);
        assert_eq!(m.attempts(), 0);
    }

    #[test]
    fn test_normal_closure_does_not_reconnect() {
        let mut m = manager(5, 30_000);
        m.connect();
        assert_eq!(m.on_close(NORMAL_CLOSURE, "bye"), CloseAction::Stay);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reconnect_failed_event() {
        let mut m = manager(1, 30_000);
        let mut events = m.subscribe();
        m.connect();
        m.on_close(ABNORMAL_CLOSURE, "dropped");
        m.on_close(ABNORMAL_CLOSURE, "dropped");

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransportEvent::ReconnectFailed { attempts: 1 }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[test]
    fn test_send_queues_while_disconnected_and_flushes_on_open() {
        let mut m = manager(5, 30_000);
        assert_eq!(m.send("a".to_string()).unwrap(), SendOutcome::Queued);
        assert_eq!(m.send("b".to_string()).unwrap(), SendOutcome::Queued);
        assert_eq!(m.send("c".to_string()).unwrap(), SendOutcome::Queued);
        assert!(matches!(
            m.send("d".to_string()),
            Err(CoeditError::QueueFull(3))
        ));

        let (tx, mut rx) = mpsc::unbounded_channel();
        m.connect();
        assert_eq!(m.on_open(tx), 3);
        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert_eq!(rx.try_recv().unwrap(), "c");

        assert_eq!(m.send("e".to_string()).unwrap(), SendOutcome::Sent);
        assert_eq!(rx.try_recv().unwrap(), "e");
    }

    #[test]
    fn test_disconnect_keeps_queue_and_stops_reconnect() {
        let mut m = manager(5, 30_000);
        let (tx, _rx) = mpsc::unbounded_channel();
        m.connect();
        m.on_open(tx);
        m.disconnect();

        assert_eq!(m.send("later".to_string()).unwrap(), SendOutcome::Queued);
        assert_eq!(m.on_close(ABNORMAL_CLOSURE, "gone"), CloseAction::Stay);
        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(m.queued(), 1);
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let mut m = ConnectionManager::new(TransportConfig {
            max_message_size: 4,
            ..TransportConfig::default()
        });
        assert!(matches!(
            m.send("too long".to_string()),
            Err(CoeditError::MessageTooLarge { .. })
        ));
        assert_eq!(m.queued(), 0);
    }
}
