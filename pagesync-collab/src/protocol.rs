//! Binary protocol for page document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id       │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8  │ varint   │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! `peer_id` identifies one open session (a client), not a user: the same
//! user editing in two tabs shows up as two peers. The relay uses the nil
//! id for messages it originates.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::{AwarenessMessage, User};

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector; the receiver answers with a `SyncStep2`
    SyncStep1 = 1,
    /// Yrs diff against a previously received state vector
    SyncStep2 = 2,
    /// Incremental yrs update
    Delta = 3,
    /// Presence update (`AwarenessMessage` payload)
    Awareness = 4,
    /// Peer joined notification (`User` payload)
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Lamport clock for causal ordering of deltas
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, doc_id: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, doc_id, clock, yrs_update)
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, 0, state_diff)
    }

    pub fn awareness(
        peer_id: Uuid,
        doc_id: &str,
        clock: u64,
        msg: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = msg.encode()?;
        Ok(Self::new(MessageType::Awareness, peer_id, doc_id, clock, payload))
    }

    pub fn peer_joined(peer_id: Uuid, doc_id: &str, user: &User) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(user, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, peer_id, doc_id, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload)
    }

    /// Parse the joining user.
    pub fn user(&self) -> Result<User, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (user, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(user)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionFailed(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionFailed(e) => write!(f, "Connection failed: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Vec2;

    #[test]
    fn test_delta_carries_doc_id_and_clock() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::delta(peer, "pages/home", 42, vec![1, 2, 3]);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.doc_id, "pages/home");
        assert_eq!(decoded.clock, 42);
    }

    #[test]
    fn test_awareness_payload() {
        let client = Uuid::new_v4();
        let cursor = AwarenessMessage::Cursor {
            client_id: client,
            position: Some(Vec2::new(10.0, 20.0)),
            timestamp: 3,
        };
        let msg = SyncMessage::awareness(client, "doc", 7, &cursor).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Awareness);
        assert_eq!(decoded.awareness_message().unwrap(), cursor);
    }

    #[test]
    fn test_peer_joined_payload() {
        let user = User::new(Uuid::new_v4(), "Alice");
        let client = Uuid::new_v4();
        let msg = SyncMessage::peer_joined(client, "doc", &user).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.peer_id, client);
        assert_eq!(decoded.user().unwrap(), user);
    }

    #[test]
    fn test_payload_accessors_check_type() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(msg.awareness_message(), Err(ProtocolError::InvalidMessageType));
        assert_eq!(msg.user(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_delta_size_efficient() {
        let msg = SyncMessage::delta(Uuid::new_v4(), "3f1c2a9e-page", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 150, "Encoded size {} too large for 50-byte delta", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Delta as u8, 3);
        assert_eq!(MessageType::Awareness as u8, 4);
        assert_eq!(MessageType::PeerJoined as u8, 5);
        assert_eq!(MessageType::PeerLeft as u8, 6);
        assert_eq!(MessageType::Ping as u8, 7);
        assert_eq!(MessageType::Pong as u8, 8);
    }
}
