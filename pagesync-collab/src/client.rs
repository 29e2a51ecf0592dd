//! WebSocket sync client for one document on the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Delta send with a Lamport clock and an offline queue
//! - Sync handshake messages (state vector / diff)
//! - Presence updates
//!
//! Everything the relay sends arrives as a [`SyncEvent`] on the channel
//! returned by [`SyncClient::take_event_rx`].

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::{AwarenessMessage, User};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

/// Maximum number of deltas held while offline.
pub const OFFLINE_QUEUE_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Incremental update from another client
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// The relay sent its state vector and expects our diff
    SyncRequested(Vec<u8>),
    /// Diff from the relay in answer to our state vector
    StateSynced(Vec<u8>),
    RemotePresence(AwarenessMessage),
    PeerJoined { client_id: Uuid, user: User },
    PeerLeft(Uuid),
}

/// Deltas produced while disconnected, replayed on the next connect.
pub struct OfflineQueue {
    queue: VecDeque<(u64, Vec<u8>)>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when the queue is full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back((clock, payload));
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|(_, payload)| payload.len()).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    /// One id per open session
    client_id: Uuid,
    user: User,
    doc_id: String,
    server_url: String,

    state: Arc<RwLock<ConnectionState>>,
    /// Lamport clock
    clock: Arc<RwLock<u64>>,
    offline_queue: Mutex<OfflineQueue>,

    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        client_id: Uuid,
        user: User,
        doc_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id,
            user,
            doc_id: doc_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Mutex::new(OfflineQueue::new(OFFLINE_QUEUE_LIMIT)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Takes the event receiver (only once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Opens the WebSocket, joins the document room and replays queued
    /// deltas. Spawns the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Dropping the previous sender ends the previous writer task.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());

        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = SyncMessage::peer_joined(self.client_id, &self.doc_id, &self.user)?.encode()?;
        out_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to {} as {} for doc {}", self.server_url, self.client_id, self.doc_id);

        let queued = self.offline_queue.lock().await.drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued deltas", queued.len());
            for (clock, payload) in queued {
                let encoded = SyncMessage::delta(self.client_id, &self.doc_id, clock, payload).encode()?;
                out_tx
                    .send(encoded)
                    .await
                    .map_err(|_| ProtocolError::ConnectionClosed)?;
            }
        }

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let clock = self.clock.clone();
        let client_id = self.client_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Dropping undecodable message: {e}");
                                continue;
                            }
                        };
                        if sync_msg.peer_id == client_id {
                            continue;
                        }
                        if let Some(event) = Self::to_event(sync_msg, &clock).await {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    async fn to_event(msg: SyncMessage, clock: &RwLock<u64>) -> Option<SyncEvent> {
        match msg.msg_type {
            MessageType::Delta => {
                let mut local = clock.write().await;
                *local = (*local).max(msg.clock);
                Some(SyncEvent::RemoteDelta {
                    peer_id: msg.peer_id,
                    clock: msg.clock,
                    update: msg.payload,
                })
            }
            MessageType::SyncStep1 => Some(SyncEvent::SyncRequested(msg.payload)),
            MessageType::SyncStep2 => Some(SyncEvent::StateSynced(msg.payload)),
            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => Some(SyncEvent::RemotePresence(awareness)),
                Err(e) => {
                    log::warn!("Bad awareness payload from {}: {e}", msg.peer_id);
                    None
                }
            },
            MessageType::PeerJoined => match msg.user() {
                Ok(user) => Some(SyncEvent::PeerJoined {
                    client_id: msg.peer_id,
                    user,
                }),
                Err(e) => {
                    log::warn!("Bad peer-joined payload from {}: {e}", msg.peer_id);
                    None
                }
            },
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(msg.peer_id)),
            MessageType::Pong => {
                log::trace!("pong");
                None
            }
            MessageType::Ping => None,
        }
    }

    async fn send_encoded(&self, encoded: Vec<u8>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx.send(encoded).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Sends an update, or queues it while disconnected.
    pub async fn send_delta(&self, yrs_update: Vec<u8>) -> Result<(), ProtocolError> {
        let current_clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };

        if self.connection_state().await != ConnectionState::Connected {
            if !self.offline_queue.lock().await.enqueue(current_clock, yrs_update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::delta(self.client_id, &self.doc_id, current_clock, yrs_update);
        self.send_encoded(msg.encode()?).await
    }

    pub async fn send_sync_step1(&self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step1(self.client_id, &self.doc_id, state_vector);
        self.send_encoded(msg.encode()?).await
    }

    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        let msg = SyncMessage::sync_step2(self.client_id, &self.doc_id, diff);
        self.send_encoded(msg.encode()?).await
    }

    /// Publishes presence. Dropped silently while offline.
    pub async fn send_presence(&self, awareness: &AwarenessMessage) -> Result<(), ProtocolError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let clock = *self.clock.read().await;
        let msg = SyncMessage::awareness(self.client_id, &self.doc_id, clock, awareness)?;
        self.send_encoded(msg.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_encoded(SyncMessage::ping(self.client_id).encode()?).await
    }

    /// Announces the leave and closes the socket once queued writes are
    /// flushed.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            if let Ok(encoded) = SyncMessage::peer_left(self.client_id, &self.doc_id).encode() {
                let _ = tx.send(encoded).await;
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(
            Uuid::new_v4(),
            User::new(Uuid::new_v4(), "TestUser"),
            "pages/home",
            "ws://127.0.0.1:9",
        )
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = client();
        assert_eq!(client.user().name, "TestUser");
        assert_eq!(client.doc_id(), "pages/home");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.clock().await, 0);
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_send_delta_offline_queues() {
        let client = client();
        client.send_delta(vec![1, 2, 3]).await.unwrap();
        client.send_delta(vec![4, 5, 6]).await.unwrap();

        assert_eq!(client.offline_queue_len().await, 2);
        assert_eq!(client.clock().await, 2);
    }

    #[tokio::test]
    async fn test_offline_presence_is_dropped_and_handshake_fails() {
        let client = client();
        let msg = AwarenessMessage::Leave { client_id: client.client_id() };
        client.send_presence(&msg).await.unwrap();
        assert_eq!(client.send_sync_step1(vec![0]).await, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connect_failure_reports_and_stays_disconnected() {
        let mut client = client();
        let result = client.connect().await;
        assert!(matches!(result, Err(ProtocolError::ConnectionFailed(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(1, vec![1, 2, 3]));
        assert!(queue.enqueue(2, vec![4, 5, 6, 7]));
        assert!(queue.enqueue(3, vec![8]));
        assert!(!queue.enqueue(4, vec![9]));
        assert_eq!(queue.total_bytes(), 8);

        let drained = queue.drain();
        assert_eq!(drained[0], (1, vec![1, 2, 3]));
        assert_eq!(drained.len(), 3);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
