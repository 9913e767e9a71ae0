use tessera_core::BoardError;
use thiserror::Error;

/// Failures of client operations. Connection problems are never reported
/// here; they surface as [`crate::ErrorNotice`]s and state changes.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no board is active; call switch_to_board first")]
    NoActiveBoard,
    #[error(transparent)]
    Board(#[from] BoardError),
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}
