//! Connection lifecycle: auth handshake, heartbeat, reconnect with backoff.
//!
//! ```text
//!                 connect()
//!  disconnected ───────────► connecting ──auth_success──► connected
//!       ▲  ▲                    │  ▲                        │
//!       │  │ close 1000         │  │ retry timer            │ close / error /
//!       │  └────────────────────┼──┴── reconnecting ◄───────┤ heartbeat timeout
//!       │                       │                           │
//!       │            open error │               close 1008  ▼
//!       └──── error ◄───────────┘                        auth_failed
//! ```
//!
//! [`ConnectionMachine`] holds the transition rules and has no I/O.
//! [`ConnectionManager`] is the per-client driver task: it owns the socket
//! reader and every timer, and turns socket/timer events into machine calls
//! inside one `select!` loop. A writer task drains an unbounded channel into
//! the socket sink.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::client::Shared;
use crate::config::ReconnectPolicy;
use crate::presence::now_millis;
use crate::protocol::{
    codes, BoardFrame, ControlMessage, ErrorDisposition, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION,
};
use crate::router::{FlushStep, Inbound};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type OpenFuture = Pin<Box<dyn Future<Output = Result<WsStream, String>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    AuthFailed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
            ConnectionStatus::AuthFailed => "auth_failed",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Unix ms of the last successful handshake.
    pub last_connected: Option<u64>,
    pub reconnect_attempts: u32,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_connected: None,
            reconnect_attempts: 0,
            error: None,
            error_code: None,
        }
    }
}

/// Published on the error channel for every failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub message: String,
    pub code: Option<String>,
}

/// What the driver should do after a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Arm the retry timer.
    Reconnect(Duration),
    Stay,
    /// Attempts exhausted; the status is now a terminal `error`.
    GaveUp,
}

// ───────────────────────────────────────────────────────────────────
// Transition rules
// ───────────────────────────────────────────────────────────────────

pub struct ConnectionMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    retry_pending: bool,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::default(),
            policy,
            retry_pending: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    fn fail(&mut self, status: ConnectionStatus, message: &str, code: &str) {
        self.state.status = status;
        self.state.error = Some(message.to_string());
        self.state.error_code = Some(code.to_string());
    }

    fn schedule_retry(&mut self) -> CloseAction {
        self.state.reconnect_attempts += 1;
        if self.state.reconnect_attempts > self.policy.max_attempts {
            self.retry_pending = false;
            self.fail(
                ConnectionStatus::Error,
                "maximum reconnect attempts reached",
                codes::MAX_RECONNECT_ATTEMPTS,
            );
            return CloseAction::GaveUp;
        }
        self.retry_pending = true;
        CloseAction::Reconnect(self.policy.next_delay(self.state.reconnect_attempts))
    }

    /// An explicit `connect()`. Returns true when a socket should be opened.
    ///
    /// A pending retry is cancelled in favor of connecting now; coming out of
    /// a terminal state starts a fresh attempt count.
    pub fn request_connect(&mut self) -> bool {
        match self.state.status {
            ConnectionStatus::Connecting
            | ConnectionStatus::Connected
            | ConnectionStatus::Reconnecting => false,
            ConnectionStatus::Disconnected | ConnectionStatus::Error | ConnectionStatus::AuthFailed => {
                if !self.retry_pending {
                    self.state.reconnect_attempts = 0;
                }
                self.retry_pending = false;
                self.state.status = ConnectionStatus::Connecting;
                true
            }
        }
    }

    /// The retry timer fired. Returns true when a socket should be opened.
    pub fn retry_fired(&mut self) -> bool {
        if !self.retry_pending {
            return false;
        }
        self.retry_pending = false;
        self.state.status = ConnectionStatus::Reconnecting;
        true
    }

    pub fn open_failed(&mut self, message: &str) -> CloseAction {
        self.fail(ConnectionStatus::Error, message, codes::TRANSPORT_ERROR);
        self.schedule_retry()
    }

    pub fn handshake_succeeded(&mut self, now_ms: u64) {
        self.retry_pending = false;
        self.state = ConnectionState {
            status: ConnectionStatus::Connected,
            last_connected: Some(now_ms),
            reconnect_attempts: 0,
            error: None,
            error_code: None,
        };
    }

    /// The server closed the socket with `code`.
    pub fn closed(&mut self, code: Option<u16>, reason: &str) -> CloseAction {
        match code {
            Some(CLOSE_NORMAL) => {
                self.retry_pending = false;
                self.state.status = ConnectionStatus::Disconnected;
                self.state.error = None;
                self.state.error_code = None;
                CloseAction::Stay
            }
            Some(CLOSE_POLICY_VIOLATION) => {
                self.retry_pending = false;
                let message = if reason.is_empty() { "authentication failed" } else { reason };
                self.fail(ConnectionStatus::AuthFailed, message, codes::POLICY_VIOLATION);
                CloseAction::Stay
            }
            Some(CLOSE_INTERNAL_ERROR) => {
                let message = if reason.is_empty() { "server error" } else { reason };
                self.fail(ConnectionStatus::Error, message, codes::SERVER_ERROR);
                self.schedule_retry()
            }
            _ => {
                let message = if reason.is_empty() { "connection closed" } else { reason };
                self.transport_failed(codes::TRANSPORT_ERROR, message)
            }
        }
    }

    /// Socket error, handshake timeout or heartbeat timeout.
    pub fn transport_failed(&mut self, code: &str, message: &str) -> CloseAction {
        self.fail(ConnectionStatus::Disconnected, message, code);
        self.schedule_retry()
    }

    /// An `error` control message from the server.
    pub fn server_error(&mut self, message: &str, code: Option<&str>) -> CloseAction {
        let code_str = code.unwrap_or(codes::SERVER_ERROR);
        match ErrorDisposition::classify(code) {
            ErrorDisposition::AuthFailed => {
                self.retry_pending = false;
                self.fail(ConnectionStatus::AuthFailed, message, code_str);
                CloseAction::Stay
            }
            ErrorDisposition::NoRetry => {
                self.retry_pending = false;
                self.fail(ConnectionStatus::Error, message, code_str);
                CloseAction::Stay
            }
            ErrorDisposition::Retry => self.transport_failed(code_str, message),
        }
    }

    pub fn disconnect_requested(&mut self) {
        self.retry_pending = false;
        self.state.status = ConnectionStatus::Disconnected;
        self.state.error = None;
        self.state.error_code = None;
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

pub(crate) enum Command {
    Connect { token: Option<String> },
    Disconnect,
}

struct Session {
    reader: SplitStream<WsStream>,
    link: mpsc::UnboundedSender<Message>,
    _writer: JoinHandle<()>,
    handshaken: bool,
}

pub(crate) struct ConnectionManager {
    shared: Arc<Shared>,
    commands: UnboundedReceiver<Command>,
    token: Option<String>,
    opening: Option<OpenFuture>,
    session: Option<Session>,
    retry_at: Option<Instant>,
    flush_at: Option<Instant>,
    handshake_deadline: Option<Instant>,
    last_liveness: Instant,
    heartbeat: Interval,
    sweep: Interval,
    published: ConnectionState,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_opening(opening: &mut Option<OpenFuture>) -> Result<WsStream, String> {
    match opening {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_message(session: &mut Option<Session>) -> Option<Result<Message, WsError>> {
    match session {
        Some(session) => session.reader.next().await,
        None => std::future::pending().await,
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

fn repeating(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl ConnectionManager {
    pub(crate) fn new(shared: Arc<Shared>, commands: UnboundedReceiver<Command>) -> Self {
        let heartbeat = repeating(shared.config.heartbeat_interval);
        let sweep = repeating(shared.config.presence_sweep_interval);
        Self {
            shared,
            commands,
            token: None,
            opening: None,
            session: None,
            retry_at: None,
            flush_at: None,
            handshake_deadline: None,
            last_liveness: Instant::now(),
            heartbeat,
            sweep,
            published: ConnectionState::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let handshaken = self.session.as_ref().is_some_and(|s| s.handshaken);
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect { token }) => self.handle_connect(token),
                    Some(Command::Disconnect) => self.handle_disconnect(),
                    None => {
                        self.handle_disconnect();
                        break;
                    }
                },
                result = poll_opening(&mut self.opening) => self.handle_opened(result),
                msg = next_message(&mut self.session) => self.handle_message(msg),
                _ = sleep_until_opt(self.retry_at) => {
                    self.retry_at = None;
                    self.handle_retry();
                }
                _ = sleep_until_opt(self.handshake_deadline) => {
                    self.handshake_deadline = None;
                    self.fail_link(codes::HANDSHAKE_TIMEOUT, "no auth_success before handshake deadline");
                }
                _ = sleep_until_opt(self.flush_at) => {
                    self.flush_at = None;
                    self.handle_flush();
                }
                _ = self.heartbeat.tick(), if handshaken => self.handle_heartbeat(),
                _ = self.sweep.tick() => self.handle_sweep(),
            }
        }
        log::debug!("connection driver stopped");
    }

    /// Apply a machine transition and publish the new state if it changed.
    fn transition<R>(&mut self, f: impl FnOnce(&mut ConnectionMachine) -> R) -> R {
        let (result, state) = {
            let mut machine = self.shared.machine.lock().unwrap_or_else(|e| e.into_inner());
            let result = f(&mut machine);
            (result, machine.state().clone())
        };
        if state != self.published {
            if state.status != self.published.status {
                log::info!("connection {} -> {}", self.published.status, state.status);
            }
            self.published = state.clone();
            self.shared.state_changes.emit(&state);
        }
        result
    }

    fn notify(&self, message: impl Into<String>, code: &str) {
        let notice = ErrorNotice {
            message: message.into(),
            code: Some(code.to_string()),
        };
        log::warn!("{} ({})", notice.message, code);
        self.shared.errors.emit(&notice);
    }

    fn apply_close_action(&mut self, action: CloseAction) {
        match action {
            CloseAction::Reconnect(delay) => {
                log::info!(
                    "reconnecting in {:?} (attempt {})",
                    delay,
                    self.published.reconnect_attempts
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            CloseAction::GaveUp => {
                self.retry_at = None;
                self.notify("maximum reconnect attempts reached", codes::MAX_RECONNECT_ATTEMPTS);
            }
            CloseAction::Stay => {}
        }
    }

    fn handle_connect(&mut self, token: Option<String>) {
        if token.is_some() {
            self.token = token;
        }
        if !self.transition(|m| m.request_connect()) {
            log::debug!("connect ignored while {}", self.published.status);
            return;
        }
        self.retry_at = None;
        self.open();
    }

    fn handle_retry(&mut self) {
        if self.transition(|m| m.retry_fired()) {
            self.open();
        }
    }

    fn open(&mut self) {
        let url = match self.shared.config.build_url(self.token.as_deref()) {
            Ok(url) => url.to_string(),
            Err(e) => {
                self.open_failed(e.to_string());
                return;
            }
        };
        log::info!("connecting to {}", self.shared.config.server_url);
        let timeout = self.shared.config.connect_timeout;
        self.opening = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
                Ok(Ok((stream, _))) => Ok(stream),
                Ok(Err(e)) => Err(format!("connection failed: {}", e)),
                Err(_) => Err(format!("connection timed out after {:?}", timeout)),
            }
        }));
    }

    fn open_failed(&mut self, message: String) {
        let action = self.transition(|m| m.open_failed(&message));
        self.notify(message, codes::TRANSPORT_ERROR);
        self.apply_close_action(action);
    }

    fn handle_opened(&mut self, result: Result<WsStream, String>) {
        self.opening = None;
        match result {
            Ok(stream) => {
                let (sink, reader) = stream.split();
                let (link, rx) = mpsc::unbounded_channel();
                let writer = tokio::spawn(write_loop(sink, rx));
                self.shared.router.attach(link.clone());
                self.session = Some(Session {
                    reader,
                    link,
                    _writer: writer,
                    handshaken: false,
                });
                self.last_liveness = Instant::now();
                self.handshake_deadline = Some(Instant::now() + self.shared.config.handshake_timeout);
                log::debug!("socket open, awaiting auth_success");
            }
            Err(message) => self.open_failed(message),
        }
    }

    /// Drop the current socket, optionally sending a close frame first.
    fn teardown(&mut self, close: Option<(CloseCode, &str)>) {
        self.handshake_deadline = None;
        self.flush_at = None;
        self.shared.router.detach();
        if let Some(session) = self.session.take() {
            if let Some((code, reason)) = close {
                let frame = CloseFrame {
                    code,
                    reason: reason.to_string().into(),
                };
                let _ = session.link.send(Message::Close(Some(frame)));
            }
        }
    }

    /// Force-close the link and re-enter the close path.
    fn fail_link(&mut self, code: &str, message: &str) {
        self.teardown(Some((CloseCode::Away, message)));
        let action = self.transition(|m| m.transport_failed(code, message));
        self.notify(message, code);
        self.apply_close_action(action);
    }

    fn handle_message(&mut self, msg: Option<Result<Message, WsError>>) {
        match msg {
            Some(Ok(Message::Binary(data))) => {
                self.last_liveness = Instant::now();
                self.handle_binary(&data);
            }
            Some(Ok(Message::Text(text))) => {
                self.last_liveness = Instant::now();
                self.handle_control(text.as_str());
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                self.last_liveness = Instant::now();
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = match frame {
                    Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                    None => (None, String::new()),
                };
                self.handle_closed(code, reason);
            }
            Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                self.teardown(None);
                let message = format!("transport error: {}", e);
                let action = self.transition(|m| m.transport_failed(codes::TRANSPORT_ERROR, &message));
                self.notify(message, codes::TRANSPORT_ERROR);
                self.apply_close_action(action);
            }
            None => self.handle_closed(None, "connection closed".to_string()),
        }
    }

    fn handle_closed(&mut self, code: Option<u16>, reason: String) {
        self.teardown(None);
        log::info!("socket closed (code {:?}) {}", code, reason);
        let action = self.transition(|m| m.closed(code, &reason));
        match code {
            Some(CLOSE_NORMAL) => {}
            Some(CLOSE_POLICY_VIOLATION) => self.notify(self.published_error(), codes::POLICY_VIOLATION),
            Some(CLOSE_INTERNAL_ERROR) => self.notify(self.published_error(), codes::SERVER_ERROR),
            _ => self.notify(self.published_error(), codes::TRANSPORT_ERROR),
        }
        self.apply_close_action(action);
    }

    fn published_error(&self) -> String {
        self.published.error.clone().unwrap_or_default()
    }

    fn handle_control(&mut self, text: &str) {
        let msg = match ControlMessage::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.notify(format!("malformed control message: {}", e), codes::PROTOCOL_ERROR);
                return;
            }
        };
        match msg {
            ControlMessage::AuthSuccess { .. } => self.handle_handshake(),
            ControlMessage::Ping { timestamp } => {
                if let Ok(pong) = ControlMessage::pong(timestamp).encode() {
                    self.shared.router.send_text(pong);
                }
            }
            ControlMessage::Pong { .. } => log::trace!("pong"),
            ControlMessage::Error { error, code } => self.handle_server_error(error, code),
        }
    }

    fn handle_handshake(&mut self) {
        match self.session.as_mut() {
            Some(session) if !session.handshaken => session.handshaken = true,
            _ => {
                log::debug!("ignoring duplicate auth_success");
                return;
            }
        }
        self.handshake_deadline = None;
        self.retry_at = None;
        let resumed = self.published.last_connected.is_some();
        self.transition(|m| m.handshake_succeeded(now_millis()));

        let (vectors, states) = {
            let registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
            let states = if resumed { registry.full_states() } else { Vec::new() };
            (registry.state_vectors(), states)
        };
        for (board_id, state_vector) in vectors {
            self.shared
                .router
                .send_frame(&BoardFrame::sync_step1(board_id, state_vector));
        }
        // Frames handed to the previous writer may never have reached the server.
        for (board_id, state) in states {
            log::debug!("[{}] resending full state after reconnect", board_id);
            self.shared.router.send_frame(&BoardFrame::sync_step2(board_id, state));
        }

        self.flush_at = Some(Instant::now());
        self.heartbeat.reset();
        self.shared.broadcast_presence();
    }

    fn handle_server_error(&mut self, error: String, code: Option<String>) {
        self.teardown(Some((CloseCode::Normal, "client closing after server error")));
        let action = self.transition(|m| m.server_error(&error, code.as_deref()));
        self.notify(error, code.as_deref().unwrap_or(codes::SERVER_ERROR));
        self.apply_close_action(action);
    }

    fn handle_flush(&mut self) {
        match self.shared.router.flush_step() {
            FlushStep::Sent(remaining) => {
                log::trace!("flushed queued update, {} remaining", remaining);
                self.flush_at = Some(Instant::now() + self.shared.config.flush_delay);
            }
            FlushStep::Drained => log::debug!("pending queue drained"),
            FlushStep::NoLink => log::debug!("flush stopped: no link"),
        }
    }

    fn handle_binary(&mut self, data: &[u8]) {
        let inbound = {
            let registry = self.shared.registry.lock().unwrap_or_else(|e| e.into_inner());
            self.shared.router.dispatch_inbound(data, &registry)
        };
        self.shared.bridge.flush_events();

        match inbound {
            Inbound::Applied { board_id } => log::trace!("[{}] applied remote update", board_id),
            Inbound::SyncReplied { board_id } => log::debug!("[{}] answered sync request", board_id),
            Inbound::UnknownBoard { board_id } => {
                log::debug!("dropping frame for unknown board {}", board_id)
            }
            Inbound::Awareness { board_id, message } => self.shared.apply_awareness(&board_id, message),
            Inbound::Rejected { board_id, error } => {
                let message = match board_id {
                    Some(id) => format!("[{}] rejected inbound frame: {}", id, error),
                    None => format!("rejected inbound frame: {}", error),
                };
                self.notify(message, codes::DECODE_ERROR);
            }
        }
    }

    fn handle_heartbeat(&mut self) {
        let limit = self.shared.config.liveness_timeout();
        let silent = self.last_liveness.elapsed();
        if silent > limit {
            let message = format!("no traffic for {:?}", silent);
            self.fail_link(codes::HEARTBEAT_TIMEOUT, &message);
            return;
        }
        if let Ok(ping) = ControlMessage::ping(now_millis()).encode() {
            self.shared.router.send_text(ping);
        }
    }

    fn handle_sweep(&mut self) {
        let evicted = self
            .shared
            .presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sweep(now_millis());
        if !evicted.is_empty() {
            log::debug!("evicted {} stale peers", evicted.len());
        }
        if self.session.as_ref().is_some_and(|s| s.handshaken) {
            self.shared.broadcast_presence();
        }
    }

    fn handle_disconnect(&mut self) {
        self.retry_at = None;
        self.opening = None;
        if self.session.as_ref().is_some_and(|s| s.handshaken) {
            self.shared.broadcast_leave();
        }
        self.teardown(Some((CloseCode::Normal, "client disconnect")));
        self.shared
            .presence
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.transition(|m| m.disconnect_requested());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy::default())
    }

    fn connected() -> ConnectionMachine {
        let mut m = machine();
        assert!(m.request_connect());
        m.handshake_succeeded(1_000);
        m
    }

    #[test]
    fn test_initial_state() {
        let m = machine();
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert_eq!(m.state().reconnect_attempts, 0);
        assert!(!m.retry_pending());
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut m = machine();
        assert!(m.request_connect());
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        assert!(!m.request_connect());

        m.handshake_succeeded(5);
        assert!(!m.request_connect());
        assert_eq!(m.state().last_connected, Some(5));
    }

    #[test]
    fn test_consecutive_server_errors_back_off() {
        let mut m = connected();
        let policy = ReconnectPolicy::default();
        let mut last_floor = Duration::ZERO;

        for attempt in 1..=5u32 {
            let action = m.closed(Some(CLOSE_INTERNAL_ERROR), "");
            assert_eq!(m.status(), ConnectionStatus::Error);
            assert_eq!(m.state().reconnect_attempts, attempt);
            assert_eq!(m.state().error_code.as_deref(), Some(codes::SERVER_ERROR));

            let CloseAction::Reconnect(delay) = action else {
                panic!("expected reconnect, got {:?}", action);
            };
            let floor = policy.delay_for(attempt, Duration::ZERO);
            assert!(floor >= last_floor);
            assert!(delay >= floor && delay <= floor + policy.max_jitter);
            assert!(delay <= policy.max_delay + policy.max_jitter);
            last_floor = floor;

            assert!(m.retry_fired());
            assert_eq!(m.status(), ConnectionStatus::Reconnecting);
        }
    }

    #[test]
    fn test_policy_violation_never_retries() {
        let mut m = connected();
        assert_eq!(m.closed(Some(CLOSE_POLICY_VIOLATION), "bad token"), CloseAction::Stay);
        assert_eq!(m.status(), ConnectionStatus::AuthFailed);
        assert_eq!(m.state().error.as_deref(), Some("bad token"));
        assert!(!m.retry_pending());
        assert!(!m.retry_fired());
    }

    #[test]
    fn test_normal_close_stays_disconnected() {
        let mut m = connected();
        assert_eq!(m.closed(Some(CLOSE_NORMAL), ""), CloseAction::Stay);
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert!(!m.retry_pending());
    }

    #[test]
    fn test_other_close_retries_from_disconnected() {
        let mut m = connected();
        assert!(matches!(m.closed(Some(4000), "bye"), CloseAction::Reconnect(_)));
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert!(m.retry_pending());

        assert!(matches!(m.closed(None, ""), CloseAction::Reconnect(_)));
        assert_eq!(m.state().reconnect_attempts, 2);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut m = ConnectionMachine::new(ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        });
        m.request_connect();
        for _ in 0..3 {
            assert!(matches!(m.open_failed("refused"), CloseAction::Reconnect(_)));
            assert!(m.retry_fired());
        }
        assert_eq!(m.open_failed("refused"), CloseAction::GaveUp);
        assert_eq!(m.status(), ConnectionStatus::Error);
        assert_eq!(m.state().error_code.as_deref(), Some(codes::MAX_RECONNECT_ATTEMPTS));
        assert!(!m.retry_fired());

        // An explicit connect starts over.
        assert!(m.request_connect());
        assert_eq!(m.state().reconnect_attempts, 0);
    }

    #[test]
    fn test_handshake_resets_attempts() {
        let mut m = connected();
        m.transport_failed(codes::HEARTBEAT_TIMEOUT, "silent");
        m.retry_fired();
        m.handshake_succeeded(9);

        let state = m.state();
        assert_eq!(state.status, ConnectionStatus::Connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert!(state.error.is_none());
        assert_eq!(state.last_connected, Some(9));
    }

    #[test]
    fn test_connect_during_backoff_cancels_retry() {
        let mut m = connected();
        m.closed(Some(CLOSE_INTERNAL_ERROR), "");
        assert!(m.retry_pending());

        assert!(m.request_connect());
        assert!(!m.retry_pending());
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        // Backoff progress is kept until a handshake succeeds.
        assert_eq!(m.state().reconnect_attempts, 1);
    }

    #[test]
    fn test_server_error_dispositions() {
        let mut m = connected();
        assert_eq!(m.server_error("expired", Some(codes::TOKEN_EXPIRED)), CloseAction::Stay);
        assert_eq!(m.status(), ConnectionStatus::AuthFailed);

        let mut m = connected();
        assert_eq!(m.server_error("slow down", Some(codes::RATE_LIMIT_EXCEEDED)), CloseAction::Stay);
        assert_eq!(m.status(), ConnectionStatus::Error);
        assert!(!m.retry_pending());

        let mut m = connected();
        assert!(matches!(m.server_error("oops", Some("INTERNAL")), CloseAction::Reconnect(_)));
        assert_eq!(m.state().error_code.as_deref(), Some("INTERNAL"));
    }

    #[test]
    fn test_disconnect_cancels_retry() {
        let mut m = connected();
        m.closed(None, "");
        m.disconnect_requested();
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert!(!m.retry_fired());
    }

    #[test]
    fn test_disconnect_clears_previous_error() {
        let mut m = connected();
        m.closed(Some(CLOSE_INTERNAL_ERROR), "boom");
        assert_eq!(m.state().error_code.as_deref(), Some(codes::SERVER_ERROR));

        m.disconnect_requested();
        let state = m.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert_eq!(state.error, None);
        assert_eq!(state.error_code, None);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ConnectionStatus::AuthFailed.to_string(), "auth_failed");
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
    }
}
