//! # tessera-collab: real-time board synchronization client
//!
//! Keeps local board documents in sync with a collaboration server over one
//! WebSocket, with an offline queue, reconnect backoff and presence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  mutations   ┌──────────────────┐  deltas   ┌──────────────┐
//! │ SyncClient   │ ───────────► │ DocumentRegistry │ ────────► │ UpdateRouter │
//! │ (context)    │              │ (doc per board)  │           │ (FIFO queue) │
//! └──────┬───────┘              └────────┬─────────┘           └──────┬───────┘
//!        │ commands                      │ observers                  │ frames
//!        ▼                               ▼                            ▼
//! ┌──────────────────┐          ┌──────────────────┐         ┌──────────────┐
//! │ConnectionManager │ ◄──────► │ ObserverBridge   │         │ writer task  │
//! │ (driver task)    │  inbound │ (CanvasView)     │         │ → WebSocket  │
//! └──────────────────┘          └──────────────────┘         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`client`]: the [`SyncClient`] context object
//! - [`connection`]: state machine and socket driver
//! - [`registry`]: board documents, created on first activation
//! - [`router`]: outbound queue and inbound demultiplexing
//! - [`observer`]: document → canvas projection
//! - [`presence`]: cursors, selection and tool of connected users
//! - [`protocol`]: control messages and the bincode `BoardFrame`
//! - [`config`]: [`SyncConfig`] and [`ReconnectPolicy`]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod observer;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;

pub use client::{ConnectionMetrics, SyncClient};
pub use config::{ReconnectPolicy, SyncConfig};
pub use connection::{
    CloseAction, ConnectionMachine, ConnectionState, ConnectionStatus, ErrorNotice,
};
pub use error::SyncError;
pub use events::{EventBus, ListenerId};
pub use observer::{CanvasEvent, CanvasView, ObserverBridge};
pub use presence::{
    AwarenessMessage, CursorColor, PresenceChange, PresenceRecord, PresenceTracker, PresenceUpdate,
    Vec2,
};
pub use protocol::{codes, BoardFrame, ControlMessage, ErrorDisposition, FrameKind, ProtocolError};
pub use registry::{DocumentRegistry, SwitchOutcome};
pub use router::{FlushStep, Inbound, Outbound, PendingQueue, RouterMetrics, UpdateRouter};
