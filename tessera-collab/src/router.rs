//! Outbound delta routing with an offline queue, and inbound frame dispatch.
//!
//! Outbound: every non-remote document change lands in
//! [`UpdateRouter::route_outbound`]. While the link is live it is framed and
//! handed to the writer task; otherwise it is appended to the pending queue.
//! After a handshake the driver drains the queue one item per
//! [`UpdateRouter::flush_step`]; the link only becomes live once the queue is
//! empty, so changes made during the drain queue up behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::Message;

use crate::presence::AwarenessMessage;
use crate::protocol::{BoardFrame, FrameKind};
use crate::registry::DocumentRegistry;

/// Updates waiting for a healthy connection. Unbounded and strictly FIFO.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queue: VecDeque<QueuedUpdate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUpdate {
    pub board_id: String,
    pub update: Vec<u8>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, board_id: &str, update: Vec<u8>) {
        self.queue.push_back(QueuedUpdate {
            board_id: board_id.to_string(),
            update,
        });
    }

    pub fn pop_front(&mut self) -> Option<QueuedUpdate> {
        self.queue.pop_front()
    }

    /// Put back an item that could not be sent.
    pub fn requeue_front(&mut self, item: QueuedUpdate) {
        self.queue.push_front(item);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.update.len()).sum()
    }
}

/// Where an outbound update went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outbound {
    Sent,
    Queued,
}

/// Result of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStep {
    /// One item sent, this many remain.
    Sent(usize),
    /// Queue empty; the link is now live.
    Drained,
    /// No writer attached; nothing was sent.
    NoLink,
}

/// What an inbound binary frame turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Applied { board_id: String },
    SyncReplied { board_id: String },
    UnknownBoard { board_id: String },
    Awareness { board_id: String, message: AwarenessMessage },
    Rejected { board_id: Option<String>, error: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterMetrics {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub queued_updates: usize,
    pub queued_bytes: usize,
}

struct AtomicRouterStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
}

impl AtomicRouterStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }
}

struct RouterInner {
    queue: PendingQueue,
    link: Option<UnboundedSender<Message>>,
    live: bool,
}

pub struct UpdateRouter {
    inner: Mutex<RouterInner>,
    stats: AtomicRouterStats,
}

impl Default for UpdateRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateRouter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                queue: PendingQueue::new(),
                link: None,
                live: false,
            }),
            stats: AtomicRouterStats::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, link: &UnboundedSender<Message>, frame: &BoardFrame) -> bool {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("[{}] failed to encode frame: {}", frame.board_id, e);
                return true;
            }
        };
        let len = bytes.len() as u64;
        if link.send(Message::Binary(bytes.into())).is_err() {
            return false;
        }
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
        true
    }

    /// Send a local update now if the link is live, else queue it.
    pub fn route_outbound(&self, board_id: &str, update: Vec<u8>) -> Outbound {
        let mut inner = self.lock();
        if inner.live {
            if let Some(link) = inner.link.clone() {
                let frame = BoardFrame::update(board_id, update);
                if self.push(&link, &frame) {
                    log::trace!("[{}] sent update ({} bytes)", board_id, frame.payload.len());
                    return Outbound::Sent;
                }
                // Writer is gone; keep the update for the next session.
                inner.link = None;
                inner.live = false;
                inner.queue.enqueue(board_id, frame.payload);
                return Outbound::Queued;
            }
        }
        inner.queue.enqueue(board_id, update);
        log::trace!("[{}] queued update, {} pending", board_id, inner.queue.len());
        Outbound::Queued
    }

    /// Attach a fresh writer. Updates keep queueing until the drain completes.
    pub fn attach(&self, link: UnboundedSender<Message>) {
        let mut inner = self.lock();
        inner.link = Some(link);
        inner.live = false;
    }

    pub fn detach(&self) {
        let mut inner = self.lock();
        inner.link = None;
        inner.live = false;
    }

    pub fn is_live(&self) -> bool {
        self.lock().live
    }

    pub fn is_attached(&self) -> bool {
        self.lock().link.is_some()
    }

    /// Send the oldest queued update, or go live if there is none.
    pub fn flush_step(&self) -> FlushStep {
        let mut inner = self.lock();
        let Some(link) = inner.link.clone() else {
            return FlushStep::NoLink;
        };
        let Some(item) = inner.queue.pop_front() else {
            inner.live = true;
            return FlushStep::Drained;
        };
        let frame = BoardFrame::update(item.board_id, item.update);
        if self.push(&link, &frame) {
            FlushStep::Sent(inner.queue.len())
        } else {
            inner.queue.requeue_front(QueuedUpdate {
                board_id: frame.board_id,
                update: frame.payload,
            });
            inner.link = None;
            inner.live = false;
            FlushStep::NoLink
        }
    }

    /// Send a frame outside the update queue. Dropped when no writer is attached.
    pub fn send_frame(&self, frame: &BoardFrame) -> bool {
        let link = self.lock().link.clone();
        match link {
            Some(link) => self.push(&link, frame),
            None => false,
        }
    }

    /// Send a text (control) frame. Dropped when no writer is attached.
    pub fn send_text(&self, text: String) -> bool {
        let link = self.lock().link.clone();
        match link {
            Some(link) => link.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Demultiplex one inbound binary frame by board id.
    ///
    /// Updates and sync replies are applied under the remote origin, sync
    /// requests for known boards are answered, awareness payloads are decoded
    /// and handed back. Frames for boards not open here are dropped.
    pub fn dispatch_inbound(&self, bytes: &[u8], registry: &DocumentRegistry) -> Inbound {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let frame = match BoardFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                return Inbound::Rejected {
                    board_id: None,
                    error: e.to_string(),
                }
            }
        };
        let board_id = frame.board_id;

        match frame.kind {
            FrameKind::Update | FrameKind::SyncStep2 => {
                match registry.apply_remote(&board_id, &frame.payload) {
                    Ok(true) => Inbound::Applied { board_id },
                    Ok(false) => Inbound::UnknownBoard { board_id },
                    Err(e) => Inbound::Rejected {
                        board_id: Some(board_id),
                        error: e.to_string(),
                    },
                }
            }
            FrameKind::SyncStep1 => match registry.diff_for(&board_id, &frame.payload) {
                Some(Ok(diff)) => {
                    self.send_frame(&BoardFrame::sync_step2(board_id.as_str(), diff));
                    Inbound::SyncReplied { board_id }
                }
                Some(Err(e)) => Inbound::Rejected {
                    board_id: Some(board_id),
                    error: e.to_string(),
                },
                None => Inbound::UnknownBoard { board_id },
            },
            FrameKind::Awareness => match AwarenessMessage::decode(&frame.payload) {
                Ok(message) => Inbound::Awareness { board_id, message },
                Err(e) => Inbound::Rejected {
                    board_id: Some(board_id),
                    error: e.to_string(),
                },
            },
        }
    }

    pub fn metrics(&self) -> RouterMetrics {
        let inner = self.lock();
        RouterMetrics {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            queued_updates: inner.queue.len(),
            queued_bytes: inner.queue.total_bytes(),
        }
    }
}
