//! The application-facing context object.
//!
//! A [`SyncClient`] owns one registry, router, observer bridge, presence
//! tracker and connection driver. Nothing is global: the application root
//! creates a client and passes it where it is needed. Dropping the client
//! closes the command channel, which stops the driver.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tessera_core::{
    erase_ops, paint_ops, BoardOp, BoardSnapshot, Shape, ShapePatch, Sprite, SpritePatch, Tile,
    TileKey, TileLayer,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connection::{
    Command, ConnectionMachine, ConnectionManager, ConnectionState, ConnectionStatus, ErrorNotice,
};
use crate::error::SyncError;
use crate::events::{EventBus, ListenerId};
use crate::observer::{CanvasEvent, CanvasView, ObserverBridge};
use crate::presence::{now_millis, AwarenessMessage, PresenceRecord, PresenceTracker, PresenceUpdate};
use crate::protocol::BoardFrame;
use crate::registry::{DocumentRegistry, SwitchOutcome};
use crate::router::UpdateRouter;

/// State shared between the client handle and its driver task.
pub(crate) struct Shared {
    pub(crate) config: SyncConfig,
    pub(crate) registry: Mutex<DocumentRegistry>,
    pub(crate) router: Arc<UpdateRouter>,
    pub(crate) bridge: ObserverBridge,
    pub(crate) presence: Mutex<PresenceTracker>,
    pub(crate) machine: Mutex<ConnectionMachine>,
    pub(crate) errors: EventBus<ErrorNotice>,
    pub(crate) state_changes: EventBus<ConnectionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn is_connected(&self) -> bool {
        lock(&self.machine).status() == ConnectionStatus::Connected && self.router.is_attached()
    }

    fn current_board_id(&self) -> Option<String> {
        lock(&self.registry).current_board_id().map(str::to_string)
    }

    /// Awareness is never queued: while not connected it is dropped.
    fn send_awareness(&self, board_id: &str, message: &AwarenessMessage) -> bool {
        if !self.is_connected() {
            return false;
        }
        match message.encode() {
            Ok(payload) => self.router.send_frame(&BoardFrame::awareness(board_id, payload)),
            Err(e) => {
                log::warn!("failed to encode awareness: {}", e);
                false
            }
        }
    }

    pub(crate) fn broadcast_presence(&self) {
        let Some(board_id) = self.current_board_id() else {
            return;
        };
        let message = {
            let mut presence = lock(&self.presence);
            presence.touch_local(now_millis());
            presence.announcement()
        };
        self.send_awareness(&board_id, &message);
    }

    pub(crate) fn broadcast_leave(&self) {
        if let Some(board_id) = self.current_board_id() {
            let farewell = lock(&self.presence).farewell();
            self.send_awareness(&board_id, &farewell);
        }
    }

    pub(crate) fn apply_awareness(&self, board_id: &str, message: AwarenessMessage) {
        if self.current_board_id().as_deref() != Some(board_id) {
            log::debug!("ignoring presence for inactive board {}", board_id);
            return;
        }
        lock(&self.presence).apply_remote(message, now_millis());
    }
}

/// Point-in-time view of the connection for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMetrics {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_connected: Option<u64>,
    pub queued_updates: usize,
    pub queued_bytes: usize,
    pub open_boards: usize,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub peers: usize,
}

pub struct SyncClient {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

impl SyncClient {
    /// Create a client for `user` and spawn its driver. Must be called from
    /// within a tokio runtime. No connection is opened until [`connect`].
    ///
    /// [`connect`]: SyncClient::connect
    pub fn new(config: SyncConfig, user: PresenceRecord) -> Self {
        let router = Arc::new(UpdateRouter::new());
        let shared = Arc::new(Shared {
            registry: Mutex::new(DocumentRegistry::new(Arc::clone(&router))),
            router,
            bridge: ObserverBridge::new(),
            presence: Mutex::new(PresenceTracker::new(user, config.presence_timeout)),
            machine: Mutex::new(ConnectionMachine::new(config.reconnect.clone())),
            errors: EventBus::new(),
            state_changes: EventBus::new(),
            config,
        });
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(ConnectionManager::new(Arc::clone(&shared), rx).run());
        Self {
            shared,
            commands,
            driver,
        }
    }

    /// Convenience constructor with a fresh user id.
    pub fn with_name(config: SyncConfig, name: impl Into<String>) -> Self {
        Self::new(config, PresenceRecord::new(Uuid::new_v4(), name))
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::error!("connection driver is not running");
        }
    }

    fn registry(&self) -> MutexGuard<'_, DocumentRegistry> {
        lock(&self.shared.registry)
    }

    // ── connection ────────────────────────────────────────────────

    /// Open the connection. A no-op while connecting, connected or
    /// reconnecting; a pending retry is replaced by an immediate attempt.
    pub fn connect(&self, token: Option<&str>) {
        self.send(Command::Connect {
            token: token.map(str::to_string),
        });
    }

    /// Close with code 1000 and cancel every timer.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Stop the driver and wait for it to finish closing the socket.
    pub async fn shutdown(self) {
        let SyncClient { commands, driver, .. } = self;
        drop(commands);
        if let Err(e) = driver.await {
            log::warn!("connection driver ended abnormally: {}", e);
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.shared.machine).state().clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.is_connected() && self.shared.router.is_live()
    }

    pub fn connection_metrics(&self) -> ConnectionMetrics {
        let state = self.connection_state();
        let router = self.shared.router.metrics();
        ConnectionMetrics {
            status: state.status,
            reconnect_attempts: state.reconnect_attempts,
            last_connected: state.last_connected,
            queued_updates: router.queued_updates,
            queued_bytes: router.queued_bytes,
            open_boards: self.registry().open_boards().len(),
            frames_sent: router.frames_sent,
            bytes_sent: router.bytes_sent,
            frames_received: router.frames_received,
            bytes_received: router.bytes_received,
            peers: lock(&self.shared.presence).peer_count(),
        }
    }

    pub fn on_error(&self, callback: impl Fn(&ErrorNotice) + Send + Sync + 'static) -> ListenerId {
        self.shared.errors.subscribe(callback)
    }

    pub fn off_error(&self, id: ListenerId) -> bool {
        self.shared.errors.unsubscribe(id)
    }

    pub fn on_connection_state_change(
        &self,
        callback: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.state_changes.subscribe(callback)
    }

    pub fn off_connection_state_change(&self, id: ListenerId) -> bool {
        self.shared.state_changes.unsubscribe(id)
    }

    // ── boards ────────────────────────────────────────────────────

    /// Activate `board_id`. Peers of the previous board are forgotten and a
    /// `Leave` is sent for it.
    pub fn switch_to_board(&self, board_id: &str) -> Result<SwitchOutcome, SyncError> {
        let outcome = self.registry().switch_to_board(board_id, &self.shared.bridge)?;
        self.shared.bridge.flush_events();

        if let Some(previous) = &outcome.previous {
            let farewell = {
                let mut presence = lock(&self.shared.presence);
                presence.clear();
                presence.farewell()
            };
            self.shared.send_awareness(previous, &farewell);
        }
        self.shared.broadcast_presence();

        log::info!(
            "active board {} (created: {}, seeded: {})",
            outcome.board_id,
            outcome.created,
            outcome.seeded
        );
        Ok(outcome)
    }

    pub fn current_board_id(&self) -> Option<String> {
        self.shared.current_board_id()
    }

    /// Replace the local view with externally loaded content.
    pub fn load_local(&self, snapshot: BoardSnapshot) {
        self.shared.bridge.load_local(snapshot);
    }

    pub fn sync_from_local(&self) -> Result<(), SyncError> {
        self.registry().sync_from_local(&self.shared.bridge)
    }

    pub fn canvas(&self) -> CanvasView {
        self.shared.bridge.view()
    }

    pub fn on_canvas_change(&self, callback: impl Fn(&CanvasEvent) + Send + Sync + 'static) -> ListenerId {
        self.shared.bridge.subscribe(callback)
    }

    pub fn off_canvas_change(&self, id: ListenerId) -> bool {
        self.shared.bridge.unsubscribe(id)
    }

    // ── mutations ─────────────────────────────────────────────────

    /// Apply `ops` in one local transaction; the resulting delta is sent or
    /// queued before this returns.
    pub fn batch_update(&self, ops: &[BoardOp]) -> Result<(), SyncError> {
        if ops.is_empty() {
            return Ok(());
        }
        self.registry().apply_local(ops, &self.shared.bridge)
    }

    pub fn add_shape(&self, shape: Shape) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::AddShape { shape }])
    }

    pub fn update_shape(&self, id: &str, patch: ShapePatch) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::UpdateShape {
            id: id.to_string(),
            patch,
        }])
    }

    pub fn delete_shape(&self, id: &str) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::DeleteShape { id: id.to_string() }])
    }

    pub fn add_tile(&self, tile: Tile) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::AddTile { tile }])
    }

    pub fn update_tile(&self, key: TileKey, tile_index: u32) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::UpdateTile { key, tile_index }])
    }

    pub fn delete_tile(&self, key: TileKey) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::DeleteTile { key }])
    }

    pub fn add_sprite(&self, sprite: Sprite) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::AddSprite { sprite }])
    }

    pub fn update_sprite(&self, id: &str, patch: SpritePatch) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::UpdateSprite {
            id: id.to_string(),
            patch,
        }])
    }

    pub fn delete_sprite(&self, id: &str) -> Result<(), SyncError> {
        self.batch_update(&[BoardOp::DeleteSprite { id: id.to_string() }])
    }

    /// Paint an autotiled cell and rewrite its neighbors in one batch.
    pub fn paint_tile(&self, x: i32, y: i32, tileset_id: &str, layer: TileLayer) -> Result<(), SyncError> {
        let tiles = self.shared.bridge.local_snapshot().tile_list();
        self.batch_update(&paint_ops(&tiles, x, y, tileset_id, layer))
    }

    /// Erase a cell and rewrite its neighbors. Erasing an empty cell is a no-op.
    pub fn erase_tile(&self, x: i32, y: i32, tileset_id: &str, layer: TileLayer) -> Result<(), SyncError> {
        let tiles = self.shared.bridge.local_snapshot().tile_list();
        self.batch_update(&erase_ops(&tiles, x, y, tileset_id, layer))
    }

    // ── presence ──────────────────────────────────────────────────

    pub fn update_user_presence(&self, update: PresenceUpdate) {
        lock(&self.shared.presence).update_local(update, now_millis());
        self.shared.broadcast_presence();
    }

    /// Peer id → record; the local user is never included.
    pub fn peers(&self) -> HashMap<Uuid, PresenceRecord> {
        lock(&self.shared.presence).peers()
    }

    pub fn local_presence(&self) -> PresenceRecord {
        lock(&self.shared.presence).local().clone()
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("server_url", &self.shared.config.server_url)
            .field("status", &self.connection_state().status)
            .field("board", &self.current_board_id())
            .finish()
    }
}
