/// WebSocket driver for the transport state machine
use futures::{Sink, SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::{
    CloseAction, ConnectionManager, ConnectionState, Result, SendOutcome, Transport,
    TransportConfig, TransportEvent, ABNORMAL_CLOSURE,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Cloneable sending side of a WebSocket transport
#[derive(Clone)]
pub struct TransportHandle {
    manager: Arc<Mutex<ConnectionManager>>,
}

impl TransportHandle {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager: Arc::new(Mutex::new(manager)),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.manager.lock().subscribe()
    }

    pub fn queued(&self) -> usize {
        self.manager.lock().queued()
    }
}

impl Transport for TransportHandle {
    fn send(&mut self, frame: String) -> Result<SendOutcome> {
        self.manager.lock().send(frame)
    }

    fn state(&self) -> ConnectionState {
        self.manager.lock().state()
    }
}

/// A running WebSocket connection with automatic reconnect
pub struct WsTransport {
    handle: TransportHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WsTransport {
    /// Start connecting to `config.url` in a background task.
    ///
    /// `events` is subscribed before the first attempt so no lifecycle
    /// event is missed.
    pub fn start(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let handle = TransportHandle::new(ConnectionManager::new(config));
        let events = handle.subscribe();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(drive(handle.manager.clone(), shutdown_rx));
        (
            Self {
                handle,
                shutdown,
                task,
            },
            events,
        )
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Close the socket and stop reconnecting. Queued frames stay queued.
    pub async fn close(self) {
        self.handle.manager.lock().disconnect();
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "transport task ended abnormally");
        }
    }
}

async fn drive(manager: Arc<Mutex<ConnectionManager>>, mut shutdown: watch::Receiver<bool>) {
    let (url, limits) = {
        let mut m = manager.lock();
        if !m.connect() {
            return;
        }
        let config = m.config();
        (
            config.url.clone(),
            Limits {
                heartbeat: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
                connect: Duration::from_millis(config.connect_timeout_ms.max(1)),
                write: Duration::from_millis(config.write_timeout_ms.max(1)),
            },
        )
    };

    loop {
        let attempt = tokio::select! {
            result = timeout(limits.connect, connect_async(url.as_str())) => result,
            _ = shutdown.changed() => break,
        };

        let failure = match attempt {
            Ok(Ok((socket, _))) => {
                info!(%url, "websocket connected");
                Ok(run_connection(&manager, socket, &limits, &mut shutdown).await)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("handshake timed out after {:?}", limits.connect)),
        };
        let action = match failure {
            Ok(action) => action,
            Err(reason) => {
                let mut m = manager.lock();
                m.on_error(reason.clone());
                m.on_close(ABNORMAL_CLOSURE, &reason)
            }
        };

        match action {
            CloseAction::Reconnect { delay, attempt } => {
                debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting to reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                manager.lock().begin_reconnect();
            }
            CloseAction::GiveUp | CloseAction::Stay => break,
        }
    }
}

struct Limits {
    heartbeat: Duration,
    connect: Duration,
    write: Duration,
}

/// Write one frame, failing if the socket does not take it within `limit`
async fn send_within<S>(sink: &mut S, message: Message, limit: Duration) -> std::result::Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match timeout(limit, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write timed out after {:?}", limit)),
    }
}

async fn run_connection(
    manager: &Arc<Mutex<ConnectionManager>>,
    socket: Socket,
    limits: &Limits,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseAction {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    manager.lock().on_open(tx);

    let mut ticker = interval_at(Instant::now() + limits.heartbeat, limits.heartbeat);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = send_within(&mut sink, Message::Close(None), limits.write).await;
                return CloseAction::Stay;
            }
            Some(frame) = rx.recv() => {
                if let Err(e) = send_within(&mut sink, Message::Text(frame.clone()), limits.write).await {
                    return close(manager, &mut rx, Some(frame), ABNORMAL_CLOSURE, &e);
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => manager.lock().on_message(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => manager.lock().on_message(text),
                    Err(_) => warn!("dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    return close(manager, &mut rx, None, code, &reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return close(manager, &mut rx, None, ABNORMAL_CLOSURE, &e.to_string());
                }
                None => {
                    return close(manager, &mut rx, None, ABNORMAL_CLOSURE, "stream ended");
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = send_within(&mut sink, Message::Ping(Vec::new()), limits.write).await {
                    return close(manager, &mut rx, None, ABNORMAL_CLOSURE, &e);
                }
            }
        }
    }
}

/// Return unwritten frames to the queue, then apply the close policy
fn close(
    manager: &Arc<Mutex<ConnectionManager>>,
    rx: &mut mpsc::UnboundedReceiver<String>,
    failed: Option<String>,
    code: u16,
    reason: &str,
) -> CloseAction {
    let mut unsent: Vec<String> = failed.into_iter().collect();
    while let Ok(frame) = rx.try_recv() {
        unsent.push(frame);
    }

    let mut m = manager.lock();
    let action = m.on_close(code, reason);
    if !unsent.is_empty() {
        debug!(frames = unsent.len(), "requeueing unsent frames");
        m.requeue_front(unsent);
    }
    action
}
