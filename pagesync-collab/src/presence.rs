//! Presence protocol: who is editing a page and where their pointer is.
//!
//! ## Architecture
//!
//! ```text
//! Local pointer move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()
//!       │  (no throttling; callers throttle by input frequency)
//!       ▼
//! AwarenessMessage::Cursor { … }
//!       │
//!       ▼   (WebSocket broadcast)
//! Remote PresenceRoom::handle_message()
//!       │
//!       ▼
//! AwarenessSnapshot ──► overlay view-models
//! ```
//!
//! Remote peers are keyed by client id (one per open session), so the same
//! user in two tabs is two entries.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Pointer position in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vec2) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &Vec2, t: f32) -> Vec2 {
        Vec2 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }
}

impl Default for Vec2 {
    fn default() -> Self {
        Self::ZERO
    }
}

/// RGBA color assigned to a user.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        let hash = id.as_u128();
        let hue = ((hash % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Identity shown to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub color: CursorColor,
}

impl User {
    /// User with a color derived from `id`, so it is the same everywhere.
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: CursorColor::from_uuid(id),
        }
    }

    pub fn with_color(mut self, color: CursorColor) -> Self {
        self.color = color;
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire protocol messages
// ───────────────────────────────────────────────────────────────────

/// Presence messages, carried in `MessageType::Awareness` payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Announce (or re-announce) a client's user.
    Join { client_id: Uuid, user: User },

    /// Clean disconnect.
    Leave { client_id: Uuid },

    /// Pointer moved; `None` when it left the canvas.
    Cursor {
        client_id: Uuid,
        position: Option<Vec2>,
        /// Per-sender monotonic counter; older updates are dropped.
        timestamp: u64,
    },
}

impl AwarenessMessage {
    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    pub fn client_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { client_id, .. }
            | AwarenessMessage::Leave { client_id }
            | AwarenessMessage::Cursor { client_id, .. } => *client_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote cursor state with interpolation
// ───────────────────────────────────────────────────────────────────

/// A remote client's presence as tracked locally.
///
/// Keeps the latest network position and a smoothed rendering position
/// that eases toward it.
#[derive(Debug, Clone)]
pub struct RemoteCursorState {
    pub client_id: Uuid,
    pub user: User,

    /// Current rendered position (interpolated).
    current: Vec2,
    /// Last network position; `None` while the pointer is off-canvas.
    target: Option<Vec2>,

    last_update: Instant,
    last_timestamp: u64,
}

impl RemoteCursorState {
    pub fn new(client_id: Uuid, user: User) -> Self {
        Self {
            client_id,
            user,
            current: Vec2::ZERO,
            target: None,
            last_update: Instant::now(),
            last_timestamp: 0,
        }
    }

    /// Applies a network cursor update. Updates older than the last one
    /// seen are ignored. Returns whether anything changed.
    pub fn update_position(&mut self, position: Option<Vec2>, timestamp: u64) -> bool {
        if timestamp < self.last_timestamp {
            return false;
        }
        self.last_timestamp = timestamp;
        self.last_update = Instant::now();

        // A cursor that reappears snaps into place instead of sweeping
        // across the page from wherever it was last seen.
        if let (None, Some(p)) = (self.target, position) {
            self.current = p;
        }
        let changed = self.target != position;
        self.target = position;
        changed
    }

    /// Marks the peer as seen without moving its cursor.
    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    /// Smoothed position for drawing, frame-rate independent.
    pub fn interpolated_position(&mut self) -> Option<Vec2> {
        let target = self.target?;
        let dt = self.last_update.elapsed().as_secs_f32();
        let smooth_factor = 0.85_f32;
        let t = 1.0 - smooth_factor.powf(dt * 60.0);

        self.current = self.current.lerp(&target, t.clamp(0.0, 1.0));
        Some(self.current)
    }

    /// Raw last network position.
    pub fn cursor(&self) -> Option<Vec2> {
        self.target
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Snapshots
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceState {
    pub user: User,
    pub cursor: Option<Vec2>,
}

/// Everyone in the document, keyed by client id. The local client is
/// included; UI consumers filter it out with `remote()`.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessSnapshot {
    pub users: HashMap<Uuid, PresenceState>,
    pub local_client_id: Uuid,
    pub local_user: User,
}

impl AwarenessSnapshot {
    pub fn remote(&self) -> impl Iterator<Item = (&Uuid, &PresenceState)> {
        self.users.iter().filter(move |(id, _)| **id != self.local_client_id)
    }

    pub fn remote_count(&self) -> usize {
        self.remote().count()
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room: tracks all remote peers
// ───────────────────────────────────────────────────────────────────

/// Presence state of one document as seen by one client.
pub struct PresenceRoom {
    local_client_id: Uuid,
    local_user: User,
    local_cursor: Option<Vec2>,
    peers: HashMap<Uuid, RemoteCursorState>,
    timestamp_counter: u64,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local_client_id: Uuid, local_user: User) -> Self {
        Self {
            local_client_id,
            local_user,
            local_cursor: None,
            peers: HashMap::new(),
            timestamp_counter: 0,
            idle_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Applies an incoming message. Returns whether the visible presence
    /// changed.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.client_id() == self.local_client_id {
            return false;
        }

        match msg {
            AwarenessMessage::Join { client_id, user } => match self.peers.get_mut(client_id) {
                Some(peer) => {
                    peer.touch();
                    if peer.user != *user {
                        peer.user = user.clone();
                        return true;
                    }
                    false
                }
                None => {
                    self.peers.insert(*client_id, RemoteCursorState::new(*client_id, user.clone()));
                    true
                }
            },

            AwarenessMessage::Leave { client_id } => self.remove_peer(client_id),

            AwarenessMessage::Cursor { client_id, position, timestamp } => {
                match self.peers.get_mut(client_id) {
                    Some(peer) => peer.update_position(*position, *timestamp),
                    // Cursor from a client whose join we have not seen yet.
                    None => {
                        let placeholder = User::new(
                            *client_id,
                            format!("Peer-{}", &client_id.to_string()[..8]),
                        );
                        let mut state = RemoteCursorState::new(*client_id, placeholder);
                        state.update_position(*position, *timestamp);
                        self.peers.insert(*client_id, state);
                        true
                    }
                }
            }
        }
    }

    pub fn remove_peer(&mut self, client_id: &Uuid) -> bool {
        self.peers.remove(client_id).is_some()
    }

    /// Forgets every remote peer, e.g. after losing the connection.
    pub fn clear_peers(&mut self) -> bool {
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        had_peers
    }

    /// Records the local pointer and returns the message to publish.
    pub fn update_local_cursor(&mut self, position: Option<Vec2>) -> AwarenessMessage {
        self.local_cursor = position;
        self.timestamp_counter += 1;
        AwarenessMessage::Cursor {
            client_id: self.local_client_id,
            position,
            timestamp: self.timestamp_counter,
        }
    }

    /// Current local cursor as a fresh message, for re-announcing after
    /// a reconnect.
    pub fn local_cursor_message(&mut self) -> AwarenessMessage {
        self.update_local_cursor(self.local_cursor)
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            client_id: self.local_client_id,
            user: self.local_user.clone(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            client_id: self.local_client_id,
        }
    }

    /// Removes peers not heard from within the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn snapshot(&self) -> AwarenessSnapshot {
        let mut users: HashMap<Uuid, PresenceState> = self
            .peers
            .iter()
            .map(|(id, peer)| {
                (
                    *id,
                    PresenceState {
                        user: peer.user.clone(),
                        cursor: peer.cursor(),
                    },
                )
            })
            .collect();
        users.insert(
            self.local_client_id,
            PresenceState {
                user: self.local_user.clone(),
                cursor: self.local_cursor,
            },
        );
        AwarenessSnapshot {
            users,
            local_client_id: self.local_client_id,
            local_user: self.local_user.clone(),
        }
    }

    pub fn peer(&self, client_id: &Uuid) -> Option<&RemoteCursorState> {
        self.peers.get(client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn local_client_id(&self) -> Uuid {
        self.local_client_id
    }

    pub fn local_user(&self) -> &User {
        &self.local_user
    }

    pub fn local_cursor(&self) -> Option<Vec2> {
        self.local_cursor
    }
}
