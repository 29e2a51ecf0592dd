//! Per-document rooms on the relay: an authoritative yrs replica plus a
//! fan-out channel to every connected client.
//!
//! Each client gets an independent receiver that buffers up to `capacity`
//! messages; slow clients lag and drop rather than stall the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use pagesync_core::collab::CollabError;

use crate::presence::User;
use crate::protocol::{ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// Fan-out channel for the clients of one document.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected clients, keyed by client id.
    peers: RwLock<HashMap<Uuid, User>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Registers a client and returns its receiver.
    pub async fn add_peer(&self, client_id: Uuid, user: User) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(client_id, user);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &Uuid) -> Option<User> {
        self.peers.write().await.remove(client_id)
    }

    /// Sends to every receiver, the sender's own included; receivers skip
    /// their own messages. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Sends pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<(Uuid, User)> {
        self.peers
            .read()
            .await
            .iter()
            .map(|(id, user)| (*id, user.clone()))
            .collect()
    }

    pub async fn has_peer(&self, client_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One document on the relay.
pub struct Room {
    doc: Mutex<Doc>,
    group: BroadcastGroup,
}

impl Room {
    pub fn new(capacity: usize) -> Self {
        Self {
            doc: Mutex::new(Doc::new()),
            group: BroadcastGroup::new(capacity),
        }
    }

    pub fn group(&self) -> &BroadcastGroup {
        &self.group
    }

    /// Merges a client update into the room replica.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), CollabError> {
        let update = Update::decode_v1(update).map_err(|e| CollabError::Decode(e.to_string()))?;
        let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CollabError::Apply(e.to_string()))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// What the room holds that a client with `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, CollabError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| CollabError::Decode(e.to_string()))?;
        let doc = self.doc.lock().unwrap_or_else(PoisonError::into_inner);
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }
}

/// A successful [`RoomManager::join`].
pub struct RoomJoin {
    pub room: Arc<Room>,
    /// Clients that were already in the room.
    pub existing: Vec<(Uuid, User)>,
    pub rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

/// Maps document ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Admits a client to the document's room, creating the room if needed.
    ///
    /// Lookup, the capacity check and registration happen under the rooms
    /// lock, so a concurrent [`RoomManager::leave`] can never drop the room
    /// between them. Returns `None` when the room already holds
    /// `max_peers` clients.
    pub async fn join(&self, doc_id: &str, client_id: Uuid, user: User, max_peers: usize) -> Option<RoomJoin> {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(doc_id) {
            Some(room) => room.clone(),
            None => {
                if max_peers == 0 {
                    return None;
                }
                log::debug!("Creating room for document {doc_id}");
                let room = Arc::new(Room::new(self.default_capacity));
                rooms.insert(doc_id.to_string(), room.clone());
                room
            }
        };

        if room.group.peer_count().await >= max_peers {
            return None;
        }
        let existing = room.group.peers().await;
        let rx = room.group.add_peer(client_id, user).await;
        Some(RoomJoin { room, existing, rx })
    }

    /// Unregisters a client and drops its room if that left it empty.
    /// The relay keeps no history: the next client to open the document
    /// seeds it again. Returns whether the room was removed.
    pub async fn leave(&self, doc_id: &str, client_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc_id).cloned() else {
            return false;
        };
        room.group.remove_peer(client_id).await;
        if room.group.peer_count().await == 0 {
            rooms.remove(doc_id);
            return true;
        }
        false
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
