//! Ephemeral per-user awareness: cursor, selection and active tool.
//!
//! ```text
//! update_user_presence()
//!       │
//!       ▼
//! PresenceTracker (local record, last_seen = now)
//!       │
//!       ▼   awareness BoardFrame (dropped while offline)
//! remote PresenceTracker::apply_remote()  (last_seen = receiver clock)
//!       │
//!       ▼
//! sweep() every 10s evicts records silent for > 30s
//! ```
//!
//! Records are never persisted and never queued.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::protocol::ProtocolError;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Position in board (world) coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// RGBA color for cursor/selection rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a user id: hue from the id,
    /// fixed saturation and lightness.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
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

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<Vec2>,
    /// Ids of selected shapes/sprites.
    pub selection: Vec<String>,
    pub tool: Option<String>,
    /// Local receive time in ms; set by whoever holds the record.
    pub last_seen: u64,
}

impl PresenceRecord {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            color: CursorColor::from_uuid(id),
            cursor: None,
            selection: Vec::new(),
            tool: None,
            last_seen: now_millis(),
        }
    }
}

/// Partial update of the local record; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub name: Option<String>,
    pub cursor: Option<Vec2>,
    pub selection: Option<Vec<String>>,
    pub tool: Option<String>,
}

impl PresenceUpdate {
    pub fn cursor(x: f32, y: f32) -> Self {
        Self {
            cursor: Some(Vec2::new(x, y)),
            ..Self::default()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Payload of an awareness frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    Update(PresenceRecord),
    Leave { user_id: Uuid },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Update(record) => record.id,
            AwarenessMessage::Leave { user_id } => *user_id,
        }
    }
}

/// What applying a remote awareness message did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(Uuid),
    Updated(Uuid),
    Left(Uuid),
    Ignored,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

pub struct PresenceTracker {
    local: PresenceRecord,
    peers: HashMap<Uuid, PresenceRecord>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(local: PresenceRecord, timeout: Duration) -> Self {
        Self {
            local,
            peers: HashMap::new(),
            timeout,
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local.id
    }

    pub fn local(&self) -> &PresenceRecord {
        &self.local
    }

    /// Merge `update` into the local record and stamp `last_seen`.
    pub fn update_local(&mut self, update: PresenceUpdate, now_ms: u64) -> &PresenceRecord {
        if let Some(name) = update.name {
            self.local.name = name;
        }
        if let Some(cursor) = update.cursor {
            self.local.cursor = Some(cursor);
        }
        if let Some(selection) = update.selection {
            self.local.selection = selection;
        }
        if let Some(tool) = update.tool {
            self.local.tool = Some(tool);
        }
        self.local.last_seen = now_ms;
        &self.local
    }

    pub fn touch_local(&mut self, now_ms: u64) {
        self.local.last_seen = now_ms;
    }

    pub fn announcement(&self) -> AwarenessMessage {
        AwarenessMessage::Update(self.local.clone())
    }

    pub fn farewell(&self) -> AwarenessMessage {
        AwarenessMessage::Leave { user_id: self.local.id }
    }

    /// Apply a peer's message. Our own id is ignored; `last_seen` is
    /// re-stamped with `now_ms` rather than trusting the sender's clock.
    pub fn apply_remote(&mut self, message: AwarenessMessage, now_ms: u64) -> PresenceChange {
        let user_id = message.user_id();
        if user_id == self.local.id {
            return PresenceChange::Ignored;
        }
        match message {
            AwarenessMessage::Update(mut record) => {
                record.last_seen = now_ms;
                match self.peers.insert(user_id, record) {
                    Some(_) => PresenceChange::Updated(user_id),
                    None => {
                        log::debug!("peer {} joined", user_id);
                        PresenceChange::Joined(user_id)
                    }
                }
            }
            AwarenessMessage::Leave { .. } => match self.peers.remove(&user_id) {
                Some(_) => {
                    log::debug!("peer {} left", user_id);
                    PresenceChange::Left(user_id)
                }
                None => PresenceChange::Ignored,
            },
        }
    }

    /// Evict peers whose `last_seen` is older than the timeout.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<Uuid> {
        let timeout_ms = self.timeout.as_millis() as u64;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.last_seen) > timeout_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
            log::debug!("evicted stale peer {}", id);
        }
        stale
    }

    /// Peer id → record, excluding the local user.
    pub fn peers(&self) -> HashMap<Uuid, PresenceRecord> {
        self.peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
