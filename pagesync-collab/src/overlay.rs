//! View-models for showing collaborators: the avatar bar and remote
//! pointer labels. The local user is never shown.

use std::collections::HashMap;
use uuid::Uuid;

use crate::presence::{AwarenessSnapshot, RemoteCursorState, User, Vec2};

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceIndicator {
    pub client_id: Uuid,
    pub name: String,
    pub initials: String,
    /// `#rrggbb`
    pub color: String,
}

/// Avatars to draw plus how many were folded into a "+N" badge.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceBar {
    pub visible: Vec<PresenceIndicator>,
    pub overflow: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorOverlay {
    pub client_id: Uuid,
    pub label: String,
    pub color: String,
    pub position: Vec2,
}

/// Up to two initials from the first and last words of `name`.
pub fn initials(name: &str) -> String {
    let mut words = name.split_whitespace();
    let first = words.next().and_then(|w| w.chars().next());
    let last = words.last().and_then(|w| w.chars().next());
    match (first, last) {
        (Some(f), Some(l)) => f.to_uppercase().chain(l.to_uppercase()).collect(),
        (Some(f), None) => f.to_uppercase().collect(),
        _ => "?".to_string(),
    }
}

fn remote_sorted(snapshot: &AwarenessSnapshot) -> Vec<(Uuid, &User, Option<Vec2>)> {
    let mut remote: Vec<(Uuid, &User, Option<Vec2>)> = snapshot
        .remote()
        .map(|(id, state)| (*id, &state.user, state.cursor))
        .collect();
    remote.sort_by(|a, b| a.1.name.cmp(&b.1.name).then(a.0.cmp(&b.0)));
    remote
}

/// Remote users sorted by name, at most `max_visible` of them.
pub fn presence_indicators(snapshot: &AwarenessSnapshot, max_visible: usize) -> PresenceBar {
    let remote = remote_sorted(snapshot);
    let overflow = remote.len().saturating_sub(max_visible);
    let visible = remote
        .into_iter()
        .take(max_visible)
        .map(|(client_id, user, _)| PresenceIndicator {
            client_id,
            name: user.name.clone(),
            initials: initials(&user.name),
            color: user.color.to_hex(),
        })
        .collect();
    PresenceBar { visible, overflow }
}

/// Remote users whose pointer is on the canvas.
pub fn cursor_overlays(snapshot: &AwarenessSnapshot) -> Vec<CursorOverlay> {
    remote_sorted(snapshot)
        .into_iter()
        .filter_map(|(client_id, user, cursor)| {
            cursor.map(|position| CursorOverlay {
                client_id,
                label: user.name.clone(),
                color: user.color.to_hex(),
                position,
            })
        })
        .collect()
}

/// Smoothly animated remote cursors fed from awareness snapshots.
///
/// Call [`PresenceOverlay::sync`] from an awareness listener and
/// [`PresenceOverlay::frame`] from the render loop; `is_dirty` tells the
/// loop whether anything needs redrawing.
#[derive(Default)]
pub struct PresenceOverlay {
    cursors: HashMap<Uuid, RemoteCursorState>,
    updates: u64,
    dirty: bool,
}

impl PresenceOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(&mut self, snapshot: &AwarenessSnapshot) {
        self.updates += 1;
        let stamp = self.updates;

        let before = self.cursors.len();
        self.cursors
            .retain(|id, _| *id != snapshot.local_client_id && snapshot.users.contains_key(id));
        if self.cursors.len() != before {
            self.dirty = true;
        }

        for (id, state) in snapshot.remote() {
            let cursor = self
                .cursors
                .entry(*id)
                .or_insert_with(|| RemoteCursorState::new(*id, state.user.clone()));
            if cursor.user != state.user {
                cursor.user = state.user.clone();
                self.dirty = true;
            }
            if cursor.update_position(state.cursor, stamp) {
                self.dirty = true;
            }
        }
    }

    /// Interpolated cursors for this frame. Clears the dirty flag.
    pub fn frame(&mut self) -> Vec<CursorOverlay> {
        self.dirty = false;
        let mut overlays: Vec<CursorOverlay> = self
            .cursors
            .values_mut()
            .filter_map(|cursor| {
                let position = cursor.interpolated_position()?;
                Some(CursorOverlay {
                    client_id: cursor.client_id,
                    label: cursor.user.name.clone(),
                    color: cursor.user.color.to_hex(),
                    position,
                })
            })
            .collect();
        overlays.sort_by(|a, b| a.label.cmp(&b.label).then(a.client_id.cmp(&b.client_id)));
        overlays
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}
