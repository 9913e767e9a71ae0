//! In-process WebSocket relay used by the integration suites.
//!
//! ```text
//! Client A ──┐                      ┌── per-board BoardDocument
//!            ├── Relay (auth mode) ─┤
//! Client B ──┘                      └── fan-out of update/awareness frames
//! ```
//!
//! The relay authenticates according to its [`AuthMode`]. A `sync_step1`
//! is answered from the relay's own copy of the board, followed by the
//! relay's own `sync_step1` so the client sends back what the relay lacks.
//! Updates and awareness go to every other connection, and every frame
//! received is recorded.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tessera_collab::{BoardFrame, ControlMessage, FrameKind, ReconnectPolicy, SyncConfig};
use tessera_core::BoardDocument;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum AuthMode {
    /// Send `auth_success` and relay normally.
    Accept,
    /// Close right after the upgrade with this code and reason.
    CloseWith(u16, &'static str),
    /// Send an `error` control message with this code, then wait for the client to close.
    ErrorCode(&'static str),
    /// Send `auth_success`, then never write again.
    Silent,
}

struct RelayState {
    auth: Mutex<AuthMode>,
    boards: Mutex<HashMap<String, BoardDocument>>,
    received: Mutex<Vec<BoardFrame>>,
    tokens: Mutex<Vec<Option<String>>>,
    peers: Mutex<Vec<(usize, mpsc::UnboundedSender<Message>)>>,
    connections: AtomicUsize,
    drop_updates: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Relay {
    pub url: String,
    state: Arc<RelayState>,
}

impl Relay {
    pub async fn start(auth: AuthMode) -> Relay {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState {
            auth: Mutex::new(auth),
            boards: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            peers: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            drop_updates: AtomicBool::new(false),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    handle_connection(stream, peer, state).await;
                });
            }
        });

        Relay {
            url: format!("ws://{}", addr),
            state,
        }
    }

    pub fn set_auth(&self, mode: AuthMode) {
        *lock(&self.state.auth) = mode;
    }

    /// While set, `update` frames are recorded but neither applied nor
    /// relayed, as if they were lost on the way.
    pub fn set_drop_updates(&self, drop: bool) {
        self.state.drop_updates.store(drop, Ordering::SeqCst);
    }

    /// Total WebSocket upgrades accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        lock(&self.state.tokens).clone()
    }

    pub fn received(&self) -> Vec<BoardFrame> {
        lock(&self.state.received).clone()
    }

    /// Update payloads received for `board_id`, in arrival order.
    pub fn updates_for(&self, board_id: &str) -> Vec<Vec<u8>> {
        lock(&self.state.received)
            .iter()
            .filter(|f| f.board_id == board_id && f.kind == FrameKind::Update)
            .map(|f| f.payload.clone())
            .collect()
    }

    pub fn shape_count(&self, board_id: &str) -> usize {
        lock(&self.state.boards)
            .get(board_id)
            .map(|doc| doc.shapes().len())
            .unwrap_or(0)
    }

    /// Send `message` to every live connection.
    pub fn send_to_all(&self, message: Message) {
        for (_, tx) in lock(&self.state.peers).iter() {
            let _ = tx.send(message.clone());
        }
    }

    pub fn close_all(&self, code: u16, reason: &str) {
        self.send_to_all(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })));
    }
}

fn token_from(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<RelayState>) {
    let mut token = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        token = token_from(request);
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("relay handshake with {} failed: {}", peer, e);
            return;
        }
    };
    // Read the mode before counting the connection so a test that waits on
    // the counter and then changes the mode affects only later connections.
    let auth = lock(&state.auth).clone();
    lock(&state.tokens).push(token);
    let id = state.connections.fetch_add(1, Ordering::SeqCst);

    let (mut sink, mut stream) = ws.split();
    match auth {
        AuthMode::CloseWith(code, reason) => {
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.to_string().into(),
                })))
                .await;
            while let Some(Ok(_)) = stream.next().await {}
            return;
        }
        AuthMode::ErrorCode(code) => {
            let error = ControlMessage::Error {
                error: format!("rejected: {}", code),
                code: Some(code.to_string()),
            };
            let _ = sink.send(Message::Text(error.encode().unwrap().into())).await;
            while let Some(Ok(_)) = stream.next().await {}
            return;
        }
        AuthMode::Accept | AuthMode::Silent => {
            let ok = ControlMessage::AuthSuccess { user_id: None };
            if sink.send(Message::Text(ok.encode().unwrap().into())).await.is_err() {
                return;
            }
        }
    }
    let silent = auth == AuthMode::Silent;

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if !silent {
        lock(&state.peers).push((id, tx.clone()));
    }
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Binary(data) => {
                let Ok(frame) = BoardFrame::decode(&data) else {
                    continue;
                };
                lock(&state.received).push(frame.clone());
                if silent {
                    continue;
                }
                if frame.kind == FrameKind::Update && state.drop_updates.load(Ordering::SeqCst) {
                    continue;
                }
                match frame.kind {
                    FrameKind::Update | FrameKind::SyncStep2 => {
                        {
                            let mut boards = lock(&state.boards);
                            let doc = boards
                                .entry(frame.board_id.clone())
                                .or_insert_with(|| BoardDocument::new(frame.board_id.clone()));
                            let _ = doc.apply_remote_update(&frame.payload);
                        }
                        let relayed = BoardFrame::update(frame.board_id.clone(), frame.payload.clone());
                        broadcast(&state, id, &relayed);
                    }
                    FrameKind::SyncStep1 => {
                        let (diff, state_vector) = {
                            let mut boards = lock(&state.boards);
                            let doc = boards
                                .entry(frame.board_id.clone())
                                .or_insert_with(|| BoardDocument::new(frame.board_id.clone()));
                            (doc.diff_since(&frame.payload), doc.state_vector())
                        };
                        if let Ok(diff) = diff {
                            let reply = BoardFrame::sync_step2(frame.board_id.clone(), diff);
                            let _ = tx.send(Message::Binary(reply.encode().unwrap().into()));
                        }
                        let request = BoardFrame::sync_step1(frame.board_id.clone(), state_vector);
                        let _ = tx.send(Message::Binary(request.encode().unwrap().into()));
                    }
                    FrameKind::Awareness => broadcast(&state, id, &frame),
                }
            }
            Message::Text(text) => {
                if silent {
                    continue;
                }
                if let Ok(ControlMessage::Ping { timestamp }) = ControlMessage::decode(text.as_str()) {
                    let pong = ControlMessage::pong(timestamp).encode().unwrap();
                    let _ = tx.send(Message::Text(pong.into()));
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    lock(&state.peers).retain(|(peer_id, _)| *peer_id != id);
    drop(tx);
    let _ = writer.await;
}

fn broadcast(state: &RelayState, from: usize, frame: &BoardFrame) {
    let bytes = frame.encode().unwrap();
    for (peer_id, tx) in lock(&state.peers).iter() {
        if *peer_id != from {
            let _ = tx.send(Message::Binary(bytes.clone().into()));
        }
    }
}

/// Short timers so reconnect paths run in milliseconds.
pub fn fast_config(url: &str) -> SyncConfig {
    SyncConfig::new(url)
        .with_room("test-room")
        .with_reconnect(ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
            max_attempts: 5,
        })
        .with_flush_delay(Duration::from_millis(1))
        .with_connect_timeout(Duration::from_secs(2))
        .with_handshake_timeout(Duration::from_secs(2))
}

/// Poll `condition` every 10 ms until it holds, panicking after 5 s.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
