//! WebSocket relay with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (doc_id) ── yrs Doc ── BroadcastGroup
//! Client B ──┘                                    │
//!                                      ┌──────────┼───────────┐
//!                                      ▼          ▼           ▼
//!                                   Client A   Client B    Client C
//! ```
//!
//! Each room keeps an authoritative replica so late joiners can catch up
//! through the `SyncStep1`/`SyncStep2` handshake. Rooms live only while
//! someone is connected; nothing is persisted.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{Room, RoomJoin, RoomManager};
use crate::presence::{AwarenessMessage, User};
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Messages buffered per client before it starts lagging
    pub broadcast_capacity: usize,
    /// Connections silent for three intervals are dropped
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PAGESYNC_BIND_ADDR`, `PAGESYNC_MAX_PEERS`,
    /// `PAGESYNC_BROADCAST_CAPACITY` and `PAGESYNC_HEARTBEAT_SECS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("PAGESYNC_BIND_ADDR") {
            config.bind_addr = addr;
        }
        override_parsed(&lookup, "PAGESYNC_MAX_PEERS", &mut config.max_peers_per_room);
        override_parsed(&lookup, "PAGESYNC_BROADCAST_CAPACITY", &mut config.broadcast_capacity);
        override_parsed(&lookup, "PAGESYNC_HEARTBEAT_SECS", &mut config.heartbeat_interval_secs);
        config
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1) * 3)
    }
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring invalid {key}={raw}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    room_manager: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown: watch::Sender<bool>,
}

/// Per-connection state once the client has joined a room.
struct Membership {
    client_id: Uuid,
    doc_id: String,
    room: Arc<Room>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let room_manager = Arc::new(RoomManager::new(config.broadcast_capacity));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            room_manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Binds `bind_addr` and serves until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until the listener
    /// fails or [`SyncServer::shutdown`] is called.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.changed() => {
                    log::info!("Sync relay shutting down");
                    return Ok(());
                }
            };
            log::debug!("New TCP connection from {addr}");

            let config = self.config.clone();
            let room_manager = self.room_manager.clone();
            let stats = self.stats.clone();
            let conn_shutdown = shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, config, room_manager, stats, conn_shutdown).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Stops accepting and closes every open connection. The listener is
    /// released once `serve` returns.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: ServerConfig,
        room_manager: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut membership: Option<Membership> = None;
        let idle_timeout = config.idle_timeout();
        let mut last_seen = Instant::now();
        let mut watchdog = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let data = match msg {
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };
                        last_seen = Instant::now();

                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode message from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }

                        match sync_msg.msg_type {
                            MessageType::Ping => {
                                let pong = SyncMessage::pong(sync_msg.peer_id).encode()?;
                                ws_sender.send(Message::Binary(pong.into())).await?;
                            }

                            MessageType::PeerJoined => {
                                if membership.is_some() {
                                    log::debug!("Ignoring repeated join from {addr}");
                                    continue;
                                }
                                let user = sync_msg
                                    .user()
                                    .unwrap_or_else(|_| User::new(sync_msg.peer_id, "Anonymous"));
                                let joined = room_manager
                                    .join(&sync_msg.doc_id, sync_msg.peer_id, user.clone(), config.max_peers_per_room)
                                    .await;
                                let Some(RoomJoin { room, existing, rx }) = joined else {
                                    log::warn!(
                                        "Room {} is full ({} peers); rejecting {}",
                                        sync_msg.doc_id,
                                        config.max_peers_per_room,
                                        sync_msg.peer_id
                                    );
                                    stats.write().await.rejected_joins += 1;
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                };
                                membership = Some(Membership {
                                    client_id: sync_msg.peer_id,
                                    doc_id: sync_msg.doc_id.clone(),
                                    room: room.clone(),
                                    rx,
                                });

                                // Tell the newcomer who is already here.
                                for (peer_id, peer_user) in existing {
                                    let announce = SyncMessage::peer_joined(peer_id, &sync_msg.doc_id, &peer_user)?;
                                    ws_sender.send(Message::Binary(announce.encode()?.into())).await?;
                                }

                                // Ask for whatever the client has that the room lacks.
                                let request = SyncMessage::sync_step1(Uuid::nil(), &sync_msg.doc_id, room.state_vector());
                                ws_sender.send(Message::Binary(request.encode()?.into())).await?;

                                room.group().broadcast(&sync_msg)?;

                                log::info!("Peer {} ({}) joined doc {}", user.name, sync_msg.peer_id, sync_msg.doc_id);
                                stats.write().await.active_rooms = room_manager.room_count().await;
                            }

                            _ => {
                                let Some(member) = membership.as_ref() else {
                                    log::debug!("Ignoring {:?} from {addr} before join", sync_msg.msg_type);
                                    continue;
                                };
                                if sync_msg.doc_id != member.doc_id {
                                    log::warn!(
                                        "Ignoring {:?} for doc {} on connection joined to {}",
                                        sync_msg.msg_type, sync_msg.doc_id, member.doc_id
                                    );
                                    continue;
                                }

                                match sync_msg.msg_type {
                                    MessageType::SyncStep1 => match member.room.encode_diff(&sync_msg.payload) {
                                        Ok(diff) => {
                                            let reply = SyncMessage::sync_step2(Uuid::nil(), &member.doc_id, diff);
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                        Err(e) => log::warn!("Bad state vector from {}: {e}", sync_msg.peer_id),
                                    },

                                    MessageType::SyncStep2 | MessageType::Delta => {
                                        if let Err(e) = member.room.apply_update(&sync_msg.payload) {
                                            log::warn!("Rejecting update from {}: {e}", sync_msg.peer_id);
                                            continue;
                                        }
                                        let delta = SyncMessage::delta(
                                            sync_msg.peer_id,
                                            &member.doc_id,
                                            sync_msg.clock,
                                            sync_msg.payload,
                                        );
                                        member.room.group().broadcast(&delta)?;
                                    }

                                    MessageType::Awareness => {
                                        match sync_msg.awareness_message() {
                                            Ok(AwarenessMessage::Join { user, .. }) => {
                                                log::trace!("Presence: {} announced in {}", user.name, member.doc_id);
                                            }
                                            Ok(AwarenessMessage::Leave { client_id }) => {
                                                log::debug!("Presence: {client_id} left {}", member.doc_id);
                                            }
                                            Ok(AwarenessMessage::Cursor { .. }) => {
                                                log::trace!("Presence: cursor update in {}", member.doc_id);
                                            }
                                            Err(e) => {
                                                log::warn!("Bad awareness payload from {}: {e}", sync_msg.peer_id);
                                                continue;
                                            }
                                        }
                                        member.room.group().broadcast(&sync_msg)?;
                                    }

                                    MessageType::PeerLeft => {
                                        log::debug!("Peer {} leaving {}", sync_msg.peer_id, member.doc_id);
                                        break;
                                    }

                                    other => log::debug!("Unhandled message type: {other:?}"),
                                }
                            }
                        }
                    }

                    msg = async {
                        match membership.as_mut() {
                            Some(member) => member.rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(data) => {
                                let own_id = membership.as_ref().map(|m| m.client_id);
                                if let Ok(decoded) = SyncMessage::decode(&data) {
                                    if Some(decoded.peer_id) == own_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {addr} lagged by {n} messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = shutdown.changed() => {
                        log::debug!("Closing connection from {addr} for shutdown");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }

                    _ = watchdog.tick() => {
                        if last_seen.elapsed() > idle_timeout {
                            log::info!("Dropping idle connection from {addr}");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        if let Some(member) = membership {
            let removed = room_manager.leave(&member.doc_id, &member.client_id).await;
            let leave = SyncMessage::peer_left(member.client_id, &member.doc_id);
            if let Err(e) = member.room.group().broadcast(&leave) {
                log::warn!("Failed to announce leave of {}: {e}", member.client_id);
            }
            if removed {
                log::info!("Room {} removed (empty)", member.doc_id);
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = room_manager.room_count().await;
        }

        result
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.room_manager
    }
}
