//! One board document per board id, created on first activation and kept
//! for the client's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use tessera_core::{BoardDocument, BoardError, BoardOp, ChangeOrigin};
use yrs::Subscription;

use crate::error::SyncError;
use crate::observer::ObserverBridge;
use crate::router::UpdateRouter;

struct BoardEntry {
    doc: BoardDocument,
    // Routes every non-remote change of this board outbound.
    _updates: Subscription,
}

/// Result of [`DocumentRegistry::switch_to_board`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub board_id: String,
    pub previous: Option<String>,
    pub created: bool,
    /// The document was empty and was filled from the local view.
    pub seeded: bool,
}

pub struct DocumentRegistry {
    boards: HashMap<String, BoardEntry>,
    current: Option<String>,
    // Collection observers of the active board only.
    observers: Vec<Subscription>,
    router: Arc<UpdateRouter>,
}

impl DocumentRegistry {
    pub fn new(router: Arc<UpdateRouter>) -> Self {
        Self {
            boards: HashMap::new(),
            current: None,
            observers: Vec::new(),
            router,
        }
    }

    fn open(&mut self, board_id: &str) -> Result<bool, BoardError> {
        if self.boards.contains_key(board_id) {
            return Ok(false);
        }
        let doc = BoardDocument::new(board_id);
        let router = Arc::clone(&self.router);
        let id = board_id.to_string();
        let updates = doc.observe_updates(move |origin, update| {
            if origin != ChangeOrigin::Remote {
                router.route_outbound(&id, update.to_vec());
            }
        })?;
        self.boards.insert(
            board_id.to_string(),
            BoardEntry {
                doc,
                _updates: updates,
            },
        );
        log::info!("created document for board {}", board_id);
        Ok(true)
    }

    /// Activate `board_id`: create its document on first use, move the
    /// collection observers to it, then either seed it from the local view
    /// (document empty, view non-empty and not owned by another board) or
    /// project it into the view.
    ///
    /// Content for a fresh board is loaded with [`ObserverBridge::load_local`]
    /// before switching; the view of a previously active board never seeds.
    pub fn switch_to_board(
        &mut self,
        board_id: &str,
        bridge: &ObserverBridge,
    ) -> Result<SwitchOutcome, BoardError> {
        let created = self.open(board_id)?;
        let previous = self.current.replace(board_id.to_string());
        self.observers.clear();

        let doc = match self.boards.get(board_id) {
            Some(entry) => &entry.doc,
            None => return Err(BoardError::Apply(format!("board {} vanished", board_id))),
        };

        let local = bridge
            .claim_local(board_id)
            .filter(|local| !local.is_empty() && doc.is_empty());
        let seeded = match local {
            Some(local) => {
                log::info!("seeding board {} from local state", board_id);
                doc.replace_with(&local)?;
                bridge.set_board(board_id);
                true
            }
            None => {
                bridge.project_all(doc);
                false
            }
        };
        self.observers = bridge.install(doc);

        Ok(SwitchOutcome {
            board_id: board_id.to_string(),
            previous: previous.filter(|p| p != board_id),
            created,
            seeded,
        })
    }

    /// Apply `ops` to the active board in one local transaction and mirror
    /// them into the view.
    pub fn apply_local(&self, ops: &[BoardOp], bridge: &ObserverBridge) -> Result<(), SyncError> {
        let doc = self.current().ok_or(SyncError::NoActiveBoard)?;
        doc.apply(ops)?;
        bridge.apply_local(ops);
        Ok(())
    }

    /// Make the active document match the local view.
    pub fn sync_from_local(&self, bridge: &ObserverBridge) -> Result<(), SyncError> {
        let doc = self.current().ok_or(SyncError::NoActiveBoard)?;
        doc.replace_with(&bridge.local_snapshot())?;
        bridge.set_board(doc.board_id());
        Ok(())
    }

    /// Apply a remote delta. `Ok(false)` means the board is not open here.
    pub fn apply_remote(&self, board_id: &str, update: &[u8]) -> Result<bool, BoardError> {
        match self.boards.get(board_id) {
            Some(entry) => entry.doc.apply_remote_update(update).map(|_| true),
            None => Ok(false),
        }
    }

    /// Diff for a peer's state vector, `None` for an unknown board.
    pub fn diff_for(&self, board_id: &str, state_vector: &[u8]) -> Option<Result<Vec<u8>, BoardError>> {
        self.boards
            .get(board_id)
            .map(|entry| entry.doc.diff_since(state_vector))
    }

    /// `(board id, state vector)` for every open board.
    pub fn state_vectors(&self) -> Vec<(String, Vec<u8>)> {
        let mut vectors: Vec<(String, Vec<u8>)> = self
            .boards
            .iter()
            .map(|(id, entry)| (id.clone(), entry.doc.state_vector()))
            .collect();
        vectors.sort_by(|a, b| a.0.cmp(&b.0));
        vectors
    }

    /// `(board id, full encoded state)` for every open board.
    pub fn full_states(&self) -> Vec<(String, Vec<u8>)> {
        let mut states: Vec<(String, Vec<u8>)> = self
            .boards
            .iter()
            .map(|(id, entry)| (id.clone(), entry.doc.encode_state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn current_board_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<&BoardDocument> {
        self.current
            .as_deref()
            .and_then(|id| self.boards.get(id))
            .map(|entry| &entry.doc)
    }

    pub fn document(&self, board_id: &str) -> Option<&BoardDocument> {
        self.boards.get(board_id).map(|entry| &entry.doc)
    }

    pub fn open_boards(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.boards.keys().cloned().collect();
        ids.sort();
        ids
    }
}
