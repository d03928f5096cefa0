//! Relay server for coedit sessions
//! One room per document path: operations and presence are fanned out to the
//! other peers and folded into the room's own replica for catch-up.

mod session;

use clap::Parser;
use coedit::{CrdtConfig, PresenceConfig};
use futures_util::{SinkExt, StreamExt};
use session::{Room, RoomConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

type Rooms = Arc<Mutex<HashMap<String, Room>>>;

#[derive(Parser, Debug)]
#[command(name = "coedit-relay")]
#[command(about = "WebSocket relay for collaborative text editing")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9300")]
    bind: SocketAddr,

    /// Largest frame accepted or sent, in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    max_message_size: usize,

    #[arg(long, default_value_t = 50)]
    max_presences: usize,

    /// Presence snapshot interval
    #[arg(long, default_value_t = 30_000)]
    heartbeat_interval_ms: u64,

    /// Compact each room's log beyond this many operations
    #[arg(long)]
    history_limit: Option<usize>,

    /// Drop a room once it has had no peers for this long
    #[arg(long, default_value_t = 3_600)]
    empty_room_secs: u64,
}

impl Args {
    fn room_config(&self) -> RoomConfig {
        RoomConfig {
            max_message_size: self.max_message_size,
            presence: PresenceConfig {
                max_presences_per_document: self.max_presences,
                heartbeat_interval_ms: self.heartbeat_interval_ms,
                ..PresenceConfig::default()
            },
            crdt: CrdtConfig {
                history_limit: self.history_limit,
                ..CrdtConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("coedit_relay=info,coedit=info")),
        )
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(args.bind).await?;
    info!("Relay listening on: {}", args.bind);

    let keep_empty = Duration::from_secs(args.empty_room_secs);
    serve(listener, args.room_config(), keep_empty).await
}

async fn serve(listener: TcpListener, config: RoomConfig, keep_empty: Duration) -> anyhow::Result<()> {
    let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
    tokio::spawn(maintain(
        rooms.clone(),
        Duration::from_millis(config.presence.heartbeat_interval_ms.max(1)),
        keep_empty,
    ));

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("New connection from: {}", addr);
        tokio::spawn(handle_connection(stream, addr, rooms.clone(), config.clone()));
    }
}

/// Presence heartbeat and stale sweep for every room, then drop rooms
/// that have been empty longer than `keep_empty`
async fn maintain(rooms: Rooms, every: Duration, keep_empty: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let mut rooms = rooms.lock().await;
        for room in rooms.values_mut() {
            room.sweep();
            if room.peer_count() > 0 {
                room.heartbeat();
            }
        }
        drop_empty_rooms(&mut rooms, Instant::now(), keep_empty);
    }
}

fn drop_empty_rooms(rooms: &mut HashMap<String, Room>, now: Instant, keep_empty: Duration) {
    rooms.retain(|document, room| {
        let expired = room
            .empty_since()
            .map_or(false, |since| now.saturating_duration_since(since) >= keep_empty);
        if expired {
            info!(%document, "dropping empty room");
        }
        !expired
    });
}

/// Document id from the request path, `/notes` -> `notes`
fn document_id(path: &str) -> String {
    let id = path.trim_matches('/');
    if id.is_empty() {
        "default".to_string()
    } else {
        id.to_string()
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, rooms: Rooms, config: RoomConfig) {
    let mut path = String::new();
    let capture_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        path = request.uri().path().to_string();
        Ok(response)
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, capture_path).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let document = document_id(&path);
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(%addr, %document, connection = %connection_id, "connection established");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Task to send frames to the peer
    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame)).await {
                warn!("Failed to send frame: {}", e);
                break;
            }
        }
    });

    rooms
        .lock()
        .await
        .entry(document.clone())
        .or_insert_with(|| Room::new(&document, &config))
        .join(&connection_id, tx);

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("Error receiving frame: {}", e);
                break;
            }
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(connection = %connection_id, "dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(_) => {
                debug!("Peer requested close");
                break;
            }
            // Pongs are answered by the protocol layer
            _ => continue,
        };

        let mut rooms = rooms.lock().await;
        if let Some(room) = rooms.get_mut(&document) {
            if let Err(e) = room.handle_frame(&connection_id, &text) {
                debug!(connection = %connection_id, error = %e, "frame rejected");
            }
        }
    }

    if let Some(room) = rooms.lock().await.get_mut(&document) {
        room.leave(&connection_id);
    }

    send_task.abort();
    info!(%addr, connection = %connection_id, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use coedit::EngineConfig;

    #[test]
    fn test_document_id_from_path() {
        assert_eq!(document_id("/notes"), "notes");
        assert_eq!(document_id("/team/notes/"), "team/notes");
        assert_eq!(document_id("/"), "default");
    }

    #[test]
    fn test_args_map_to_room_config() {
        let args = Args::parse_from(["coedit-relay", "--max-presences", "7", "--history-limit", "100"]);
        let config = args.room_config();
        assert_eq!(config.presence.max_presences_per_document, 7);
        assert_eq!(config.crdt.history_limit, Some(100));
        assert_eq!(config.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_empty_rooms_dropped_after_grace() {
        let config = Args::parse_from(["coedit-relay"]).room_config();
        let mut rooms = HashMap::new();
        rooms.insert("idle".to_string(), Room::new("idle", &config));
        let mut busy = Room::new("busy", &config);
        let (tx, _rx) = mpsc::unbounded_channel();
        busy.join("peer", tx);
        rooms.insert("busy".to_string(), busy);

        drop_empty_rooms(&mut rooms, Instant::now(), Duration::from_secs(60));
        assert_eq!(rooms.len(), 2);

        drop_empty_rooms(&mut rooms, Instant::now() + Duration::from_secs(61), Duration::from_secs(60));
        assert!(rooms.contains_key("busy"));
        assert!(!rooms.contains_key("idle"));
    }

    fn client(addr: SocketAddr, user: &str, site: &str) -> EngineConfig {
        let mut config = EngineConfig::new("notes", user).with_site_id(site);
        config.transport.url = format!("ws://{}/notes", addr);
        config.sync.sync_interval_ms = 20;
        config
    }

    async fn wait_for_content(handle: &coedit::EngineHandle, expected: &str) -> String {
        let mut content = String::new();
        for _ in 0..250 {
            content = handle.content().await.unwrap();
            if content == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        content
    }

    #[tokio::test]
    async fn test_two_sessions_converge_through_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Args::parse_from(["coedit-relay"]).room_config();
        tokio::spawn(serve(listener, config, Duration::from_secs(60)));

        let ada = coedit::connect(client(addr, "ada", "site-ada")).unwrap();
        let bob = coedit::connect(client(addr, "bob", "site-bob")).unwrap();

        ada.handle().insert_text(0, "hello").await.unwrap();
        assert_eq!(wait_for_content(&bob.handle(), "hello").await, "hello");

        bob.handle().insert_text(5, " world").await.unwrap();
        assert_eq!(
            wait_for_content(&ada.handle(), "hello world").await,
            "hello world"
        );

        ada.close().await.unwrap();
        bob.close().await.unwrap();
    }
}
