//! Wire protocol between a client and the sync server.
//!
//! Text frames carry JSON control messages; binary frames carry a
//! bincode-encoded [`BoardFrame`]:
//! ```text
//! ┌────────────┬──────────┬─────────────────────────────┐
//! │ board_id   │ kind     │ payload                     │
//! │ len+utf8   │ 1 byte   │ len+bytes (yrs v1 / bincode)│
//! └────────────┴──────────┴─────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Clean shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server rejected the credentials.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Server-side failure; worth retrying.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Error codes. Server codes arrive in `error` control messages, the rest
/// are raised locally and travel with [`crate::ErrorNotice`].
pub mod codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const NO_TOKEN: &str = "NO_TOKEN";
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const TOKEN_EXPIRED: &str = "TOKEN_EXPIRED";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const MESSAGE_RATE_LIMIT: &str = "MESSAGE_RATE_LIMIT";

    pub const POLICY_VIOLATION: &str = "POLICY_VIOLATION";
    pub const SERVER_ERROR: &str = "SERVER_ERROR";
    pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";
    pub const HANDSHAKE_TIMEOUT: &str = "HANDSHAKE_TIMEOUT";
    pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
    pub const MAX_RECONNECT_ATTEMPTS: &str = "MAX_RECONNECT_ATTEMPTS";
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid control message: {0}")]
    Control(#[from] serde_json::Error),
}

// ───────────────────────────────────────────────────────────────────
// Control messages (JSON text frames)
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    AuthSuccess {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ControlMessage {
    pub fn ping(timestamp: u64) -> Self {
        ControlMessage::Ping { timestamp: Some(timestamp) }
    }

    pub fn pong(timestamp: Option<u64>) -> Self {
        ControlMessage::Pong { timestamp }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// How the client reacts to a server `error` code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Credentials are bad; stop until a new token is supplied.
    AuthFailed,
    /// Rate limited; stop retrying this attempt.
    NoRetry,
    /// Close the socket and reconnect per policy.
    Retry,
}

impl ErrorDisposition {
    pub fn classify(code: Option<&str>) -> Self {
        match code {
            Some(codes::AUTH_FAILED | codes::NO_TOKEN | codes::INVALID_TOKEN | codes::TOKEN_EXPIRED) => {
                ErrorDisposition::AuthFailed
            }
            Some(codes::RATE_LIMIT_EXCEEDED | codes::MESSAGE_RATE_LIMIT) => ErrorDisposition::NoRetry,
            _ => ErrorDisposition::Retry,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Board frames (bincode binary frames)
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// Incremental yrs v1 update
    Update,
    /// yrs state vector; the receiver answers with `SyncStep2`
    SyncStep1,
    /// yrs diff against a received state vector
    SyncStep2,
    /// bincode [`crate::AwarenessMessage`]
    Awareness,
}

/// Board-scoped envelope for every binary frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardFrame {
    pub board_id: String,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl BoardFrame {
    pub fn new(board_id: impl Into<String>, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            board_id: board_id.into(),
            kind,
            payload,
        }
    }

    pub fn update(board_id: impl Into<String>, update: Vec<u8>) -> Self {
        Self::new(board_id, FrameKind::Update, update)
    }

    pub fn sync_step1(board_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(board_id, FrameKind::SyncStep1, state_vector)
    }

    pub fn sync_step2(board_id: impl Into<String>, diff: Vec<u8>) -> Self {
        Self::new(board_id, FrameKind::SyncStep2, diff)
    }

    pub fn awareness(board_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(board_id, FrameKind::Awareness, payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}
