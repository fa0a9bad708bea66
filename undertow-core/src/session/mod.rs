//! Torrent download session management.
//!
//! The session manager owns every transfer record, reconciles live engine
//! status into the lifecycle state machine on a fixed cadence, persists what
//! is needed to resume after a restart, and exposes the command surface used
//! by front ends.

pub mod listeners;
mod manager;
pub mod record;
mod reconcile;
mod restore;

use std::time::Duration;

pub use listeners::{ListenerId, ListenerRegistry, TransferListener};
pub use manager::{FlushReport, SessionManager};
pub use record::{
    AddOutcome, FileEntry, FilePriority, TransferRecord, TransferState, placeholder_name,
};
pub use restore::RestoreReport;

use crate::engine::EngineError;
use crate::storage::StorageError;
use crate::torrent::{InfoHash, TorrentError};

/// Errors returned by session manager commands.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid source: {reason}")]
    InvalidSource { reason: String },

    #[error("Engine rejected transfer: {reason}")]
    EngineRejected { reason: String },

    #[error("Transfer {id} not found")]
    NotFound { id: InfoHash },

    #[error("Transfer {id} is not active in the engine")]
    NotRegistered { id: InfoHash },

    #[error("Metadata for {id} not available after {waited:?}")]
    MetadataTimeout { id: InfoHash, waited: Duration },

    #[error("Metadata for {id} has not arrived yet")]
    MetadataPending { id: InfoHash },

    #[error("File index {index} out of range for {id} ({file_count} files)")]
    InvalidFileIndex {
        id: InfoHash,
        index: usize,
        file_count: usize,
    },

    #[error("No files selected for {id}")]
    EmptySelection { id: InfoHash },

    #[error("Transfer {id} is completed; file {index} cannot be downloaded again")]
    AlreadyCompleted { id: InfoHash, index: usize },

    #[error("Engine call failed for {id}: {error}")]
    Engine {
        id: InfoHash,
        #[source]
        error: EngineError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session is shutting down")]
    ShuttingDown,
}

impl From<TorrentError> for SessionError {
    fn from(error: TorrentError) -> Self {
        SessionError::InvalidSource {
            reason: error.to_string(),
        }
    }
}

impl SessionError {
    pub(crate) fn engine(id: InfoHash) -> impl FnOnce(EngineError) -> Self {
        move |error| SessionError::Engine { id, error }
    }
}
