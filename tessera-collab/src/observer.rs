//! Projection of the active board document into the local canvas view.
//!
//! Collection observers skip transactions tagged `"local"`: those changes
//! already went into the view when the mutation was issued. Everything else
//! replaces the affected collection in the view and queues a [`CanvasEvent`];
//! events are published by [`ObserverBridge::flush_events`] once the caller
//! has released the registry lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tessera_core::{
    BoardDocument, BoardOp, BoardSnapshot, ChangeOrigin, Collection, CollectionContents,
};
use yrs::Subscription;

use crate::events::{EventBus, ListenerId};

/// What collaborators render: the active board id and its contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanvasView {
    pub board_id: Option<String>,
    pub snapshot: BoardSnapshot,
}

/// A collection of the active board was replaced from the document.
#[derive(Debug, Clone, PartialEq)]
pub struct CanvasEvent {
    pub board_id: String,
    pub contents: CollectionContents,
}

#[derive(Default)]
pub struct ObserverBridge {
    view: Arc<RwLock<CanvasView>>,
    pending: Arc<Mutex<Vec<CanvasEvent>>>,
    events: EventBus<CanvasEvent>,
    // Set by `load_local` until a board takes ownership of the loaded content.
    unclaimed: AtomicBool,
}

impl ObserverBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install collection observers on `doc`. Dropping the returned
    /// subscriptions removes them.
    pub fn install(&self, doc: &BoardDocument) -> Vec<Subscription> {
        Collection::ALL
            .iter()
            .map(|collection| {
                let view = Arc::clone(&self.view);
                let pending = Arc::clone(&self.pending);
                let board_id = doc.board_id().to_string();
                doc.observe_collection(*collection, move |origin, contents| {
                    if origin == ChangeOrigin::Local {
                        return;
                    }
                    {
                        let mut view = view.write().unwrap_or_else(|e| e.into_inner());
                        if view.board_id.as_deref() != Some(board_id.as_str()) {
                            return;
                        }
                        view.snapshot.replace(&contents);
                    }
                    pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(CanvasEvent {
                            board_id: board_id.clone(),
                            contents,
                        });
                })
            })
            .collect()
    }

    /// Replace the whole view with the document contents.
    pub fn project_all(&self, doc: &BoardDocument) {
        let snapshot = doc.snapshot();
        let events = vec![
            CollectionContents::Shapes(snapshot.shapes.values().cloned().collect()),
            CollectionContents::Tiles(snapshot.tiles.values().cloned().collect()),
            CollectionContents::Sprites(snapshot.sprites.values().cloned().collect()),
        ];
        {
            let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
            view.board_id = Some(doc.board_id().to_string());
            view.snapshot = snapshot;
        }
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.extend(events.into_iter().map(|contents| CanvasEvent {
            board_id: doc.board_id().to_string(),
            contents,
        }));
    }

    pub fn set_board(&self, board_id: &str) {
        let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
        view.board_id = Some(board_id.to_string());
        self.unclaimed.store(false, Ordering::SeqCst);
    }

    /// The view contents if they may seed `board_id`: either they were loaded
    /// with [`load_local`](Self::load_local) and not yet claimed, or the view
    /// already belongs to that board. Content of another board is never
    /// returned. Any loaded content is claimed by this call.
    pub fn claim_local(&self, board_id: &str) -> Option<BoardSnapshot> {
        let view = self.view.read().unwrap_or_else(|e| e.into_inner());
        let loaded = self.unclaimed.swap(false, Ordering::SeqCst);
        if loaded || view.board_id.as_deref() == Some(board_id) {
            Some(view.snapshot.clone())
        } else {
            None
        }
    }

    /// Mirror local operations into the view.
    pub fn apply_local(&self, ops: &[BoardOp]) {
        let mut view = self.view.write().unwrap_or_else(|e| e.into_inner());
        for op in ops {
            view.snapshot.apply(op);
        }
    }

    /// Replace the view contents with externally loaded state. The content
    /// belongs to whichever board is activated or synced next.
    pub fn load_local(&self, snapshot: BoardSnapshot) {
        self.view.write().unwrap_or_else(|e| e.into_inner()).snapshot = snapshot;
        self.unclaimed.store(true, Ordering::SeqCst);
    }

    pub fn view(&self) -> CanvasView {
        self.view.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn local_snapshot(&self) -> BoardSnapshot {
        self.view.read().unwrap_or_else(|e| e.into_inner()).snapshot.clone()
    }

    /// Publish queued events. Must not be called with the registry locked.
    pub fn flush_events(&self) {
        let drained: Vec<CanvasEvent> =
            std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()));
        for event in &drained {
            self.events.emit(event);
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&CanvasEvent) + Send + Sync + 'static) -> ListenerId {
        self.events.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }
}
