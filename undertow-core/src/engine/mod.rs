//! Engine adapter.
//!
//! The torrent protocol itself (peer wire, DHT, trackers) runs inside an
//! external engine. This module is the call surface the session manager
//! uses to drive it. Transfers are addressed by fingerprint because the
//! engine deduplicates on it.

pub mod simulated;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use simulated::{CatalogEntry, EngineCall, FaultPlan, SimulatedEngine};

use crate::torrent::InfoHash;

/// Operations the session manager needs from a torrent engine.
///
/// Implementations must be safe to call concurrently; the session manager
/// never holds its own lock while awaiting one of these.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Registers a transfer and returns its fingerprint.
    ///
    /// Adding a fingerprint the engine already knows returns the existing
    /// transfer's fingerprint without creating a second one.
    ///
    /// # Errors
    /// - `EngineError::Rejected` - Parameters unusable or engine refused them
    async fn add_transfer(&self, params: AddTransferParams) -> Result<InfoHash, EngineError>;

    /// Removes a transfer, optionally deleting downloaded data.
    async fn remove_transfer(
        &self,
        info_hash: InfoHash,
        delete_files: bool,
    ) -> Result<(), EngineError>;

    async fn pause(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    async fn resume(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    /// Toggles whether the engine's queue may start and stop the transfer.
    async fn set_auto_managed(&self, info_hash: InfoHash, enabled: bool)
    -> Result<(), EngineError>;

    /// Discards piece verification state and re-hashes data on disk.
    async fn force_recheck(&self, info_hash: InfoHash) -> Result<(), EngineError>;

    /// Live status of one transfer.
    async fn status(&self, info_hash: InfoHash) -> Result<EngineStatus, EngineError>;

    /// File manifest, one read result per file.
    ///
    /// The outer error means the manifest as a whole is unavailable; an inner
    /// error means a single entry could not be read.
    async fn file_manifest(&self, info_hash: InfoHash) -> Result<Vec<FileRead>, EngineError>;

    /// Bytes downloaded per file, in manifest order.
    async fn file_progress(&self, info_hash: InfoHash) -> Result<Vec<u64>, EngineError>;

    async fn set_file_priority(
        &self,
        info_hash: InfoHash,
        index: usize,
        priority: EnginePriority,
    ) -> Result<(), EngineError>;

    /// Serializes the transfer's resume state.
    async fn save_resume_blob(&self, info_hash: InfoHash) -> Result<Bytes, EngineError>;

    /// Decodes a resume blob back into registration parameters.
    ///
    /// # Errors
    /// - `EngineError::CorruptResumeData` - Blob cannot be decoded
    async fn params_from_resume_blob(&self, blob: &[u8]) -> Result<AddTransferParams, EngineError>;

    /// Raw torrent descriptor, once the engine has one.
    async fn export_descriptor(&self, info_hash: InfoHash) -> Result<Option<Bytes>, EngineError>;

    /// Engine-wide state (DHT routing table and similar).
    async fn global_state(&self) -> Result<Bytes, EngineError>;

    async fn restore_global_state(&self, state: &[u8]) -> Result<(), EngineError>;

    /// Applies session-wide bandwidth limits and queue sizes.
    ///
    /// Auto-managed transfers beyond the active limits are paused by the
    /// engine's queue and started again as slots free up.
    async fn apply_settings(&self, settings: EngineSettings) -> Result<(), EngineError>;

    /// Stops all engine activity. Further calls fail with `EngineError::Shutdown`.
    async fn shutdown(&self) -> Result<(), EngineError>;
}

/// Parameters for registering a transfer with the engine.
///
/// At least one of `magnet_uri`, `descriptor` or `resume_data` must be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AddTransferParams {
    pub info_hash: Option<InfoHash>,
    pub name: Option<String>,
    pub magnet_uri: Option<String>,
    pub descriptor: Option<Bytes>,
    pub resume_data: Option<Bytes>,
    pub trackers: Vec<String>,
    pub save_path: PathBuf,
    pub file_priorities: Option<Vec<EnginePriority>>,
    pub paused: bool,
    pub auto_managed: bool,
    pub max_connections: Option<u32>,
}

impl AddTransferParams {
    /// True when the parameters identify content the engine can fetch.
    pub fn has_source(&self) -> bool {
        self.magnet_uri.is_some() || self.descriptor.is_some() || self.resume_data.is_some()
    }

    /// Appends trackers not already present, keeping existing order.
    pub fn append_trackers(&mut self, trackers: &[String]) {
        for tracker in trackers {
            if !self.trackers.contains(tracker) {
                self.trackers.push(tracker.clone());
            }
        }
    }
}

/// Session-wide engine settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSettings {
    /// Bytes per second, 0 = unlimited
    pub download_rate_limit: u64,
    /// Bytes per second, 0 = unlimited
    pub upload_rate_limit: u64,
    pub max_active_downloads: Option<usize>,
    pub max_active_seeds: Option<usize>,
}

/// Engine-native transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    CheckingFiles,
    CheckingResumeData,
    DownloadingMetadata,
    Downloading,
    Finished,
    Seeding,
    Allocating,
}

/// Live status reported by the engine for one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub paused: bool,
    pub auto_managed: bool,
    pub has_metadata: bool,
    pub progress: f32,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peers: u32,
    pub seeds: u32,
    pub total_wanted: u64,
    pub total_wanted_done: u64,
    pub total_uploaded: u64,
    pub name: Option<String>,
    pub error: Option<String>,
}

/// One entry of the engine's file manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineFile {
    pub index: usize,
    pub path: String,
    pub size: u64,
    pub priority: EnginePriority,
}

/// Result of reading a single manifest entry.
pub type FileRead = Result<EngineFile, EngineError>;

/// Engine-native file priority on a 0..=7 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnginePriority(pub u8);

impl EnginePriority {
    pub const SKIP: Self = Self(0);
    pub const LOW: Self = Self(1);
    pub const NORMAL: Self = Self(4);
    pub const HIGH: Self = Self(7);

    pub fn is_wanted(self) -> bool {
        self.0 > 0
    }
}

impl Default for EnginePriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for EnginePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors reported by an engine adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Transfer {info_hash} is not registered with the engine")]
    UnknownTransfer { info_hash: InfoHash },

    #[error("Engine rejected transfer: {reason}")]
    Rejected { reason: String },

    #[error("Resume data is corrupt: {reason}")]
    CorruptResumeData { reason: String },

    #[error("Metadata not yet available for {info_hash}")]
    MetadataUnavailable { info_hash: InfoHash },

    #[error("File {index} unreadable: {reason}")]
    FileUnavailable { index: usize, reason: String },

    #[error("Engine status read failed for {info_hash}: {reason}")]
    StatusUnavailable { info_hash: InfoHash, reason: String },

    #[error("Engine has shut down")]
    Shutdown,
}
