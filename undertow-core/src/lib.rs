//! Undertow Core - torrent download session management
//!
//! This crate owns the lifecycle of every transfer handed to an external
//! torrent engine: it reconciles live engine status into a stable state
//! machine, persists what is needed to resume after a restart, and exposes
//! a concurrent command surface to front ends.

pub mod config;
pub mod engine;
pub mod format;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use engine::{EngineError, SimulatedEngine, TransferEngine};
pub use session::{
    AddOutcome, FileEntry, FilePriority, SessionError, SessionManager, TransferRecord,
    TransferState,
};
pub use storage::{StateStore, StorageError};
pub use torrent::{DiscoveredTorrent, InfoHash, TorrentError};

/// Errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => format!("Could not read that source: {e}"),
            UndertowError::Session(e) => match e {
                SessionError::InvalidSource { reason } => {
                    format!("Could not read that source: {reason}")
                }
                SessionError::EngineRejected { reason } => {
                    format!("The download could not be started: {reason}")
                }
                SessionError::NotFound { id } => format!("No transfer with id {id}"),
                SessionError::MetadataTimeout { .. } => {
                    "Still waiting for the file list; try again in a moment".to_string()
                }
                SessionError::InvalidFileIndex { index, .. } => {
                    format!("There is no file number {index}")
                }
                SessionError::AlreadyCompleted { index, .. } => {
                    format!("The download is complete; remove and re-add it to fetch file {index}")
                }
                SessionError::ShuttingDown => "The session is closing".to_string(),
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Engine(_) => "Download engine error occurred".to_string(),
            UndertowError::Storage(_) => "Could not save download state".to_string(),
            UndertowError::Configuration { reason } => format!("Configuration error: {reason}"),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Torrent(_)
                | UndertowError::Session(
                    SessionError::InvalidSource { .. }
                        | SessionError::NotFound { .. }
                        | SessionError::InvalidFileIndex { .. }
                        | SessionError::EmptySelection { .. }
                        | SessionError::AlreadyCompleted { .. }
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors() {
        let not_found = UndertowError::from(SessionError::NotFound {
            id: InfoHash::new([1; 20]),
        });
        assert!(not_found.is_user_error());
        assert!(not_found.user_message().contains("0101"));

        let rejected = UndertowError::from(SessionError::EngineRejected {
            reason: "full".to_string(),
        });
        assert!(!rejected.is_user_error());
        assert!(rejected.user_message().contains("full"));
    }
}
