//! Transfer records and the engine-to-lifecycle translation policy.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{EngineFile, EnginePriority, EngineState, EngineStatus};
use crate::torrent::InfoHash;

/// Application-level lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferState {
    Queued,
    MetadataLoading,
    Checking,
    Allocating,
    Downloading,
    Seeding,
    Completed,
    Paused,
    Stopped,
    Error,
}

impl TransferState {
    /// States the restore path leaves unregistered.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }

    /// States in which progress may only move forward.
    pub fn is_transferring(self) -> bool {
        matches!(self, Self::Downloading | Self::Seeding)
    }

    /// Translates an engine status read into a lifecycle state.
    ///
    /// A paused transfer that the engine queue manages is `Queued`, not
    /// `Paused`; the user never asked for it to stop.
    pub fn from_engine(status: &EngineStatus, manually_stopped: bool) -> Self {
        if status.error.is_some() {
            return Self::Error;
        }

        if status.paused {
            return if status.auto_managed {
                Self::Queued
            } else if manually_stopped {
                Self::Stopped
            } else {
                Self::Paused
            };
        }

        match status.state {
            EngineState::CheckingFiles | EngineState::CheckingResumeData => Self::Checking,
            EngineState::Allocating => Self::Allocating,
            EngineState::DownloadingMetadata => Self::MetadataLoading,
            EngineState::Downloading => Self::Downloading,
            EngineState::Finished => Self::Completed,
            EngineState::Seeding => Self::Seeding,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::MetadataLoading => "Fetching metadata",
            Self::Checking => "Checking",
            Self::Allocating => "Allocating",
            Self::Downloading => "Downloading",
            Self::Seeding => "Seeding",
            Self::Completed => "Completed",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

/// User-facing four-level file priority.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum FilePriority {
    Skip,
    Low,
    #[default]
    Normal,
    High,
}

impl FilePriority {
    /// Engine-native level for this priority.
    pub fn to_engine(self) -> EnginePriority {
        match self {
            Self::Skip => EnginePriority::SKIP,
            Self::Low => EnginePriority::LOW,
            Self::Normal => EnginePriority::NORMAL,
            Self::High => EnginePriority::HIGH,
        }
    }

    /// Nearest user-facing priority for an engine-native level.
    pub fn from_engine(level: EnginePriority) -> Self {
        match level.0 {
            0 => Self::Skip,
            1..=3 => Self::Low,
            4..=5 => Self::Normal,
            _ => Self::High,
        }
    }
}

impl fmt::Display for FilePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Skip => "skip",
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.pad(label)
    }
}

impl FromStr for FilePriority {
    type Err = String;

    /// Accepts names or the 0..=3 index used by selection dialogs.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" | "0" => Ok(Self::Skip),
            "low" | "1" => Ok(Self::Low),
            "normal" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            _ => Err(format!("Invalid file priority: {s}")),
        }
    }
}

/// One file inside a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub index: usize,
    pub relative_path: String,
    pub size_bytes: u64,
    pub downloaded_bytes: u64,
    pub priority: FilePriority,
}

impl FileEntry {
    pub fn progress(&self) -> f32 {
        if self.size_bytes == 0 {
            return 1.0;
        }
        (self.downloaded_bytes as f64 / self.size_bytes as f64).min(1.0) as f32
    }
}

impl From<EngineFile> for FileEntry {
    fn from(file: EngineFile) -> Self {
        Self {
            index: file.index,
            relative_path: file.path,
            size_bytes: file.size,
            downloaded_bytes: 0,
            priority: FilePriority::from_engine(file.priority),
        }
    }
}

/// In-memory state of one tracked transfer.
///
/// Callers only ever see clones; the live records stay inside the session
/// manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: InfoHash,
    pub source_uri: Option<String>,
    pub display_name: String,
    pub size_hint: Option<String>,
    pub save_path: PathBuf,
    pub state: TransferState,
    pub progress: f32,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peers: u32,
    pub seeds: u32,
    pub eta_seconds: Option<u64>,
    pub has_metadata: bool,
    pub files: Vec<FileEntry>,
    pub manually_stopped: bool,
    pub visible: bool,
    pub last_error: Option<String>,
    pub added_at: DateTime<Utc>,
    /// Whether the engine currently knows this transfer.
    #[serde(skip)]
    pub(crate) registered: bool,
    /// File selection to apply once metadata arrives.
    #[serde(skip)]
    pub(crate) pending_selection: Option<Vec<usize>>,
}

impl TransferRecord {
    /// Creates a record for a transfer that has not reported status yet.
    pub fn new(id: InfoHash, source_uri: Option<String>, save_path: PathBuf) -> Self {
        Self {
            id,
            source_uri,
            display_name: placeholder_name(&id),
            size_hint: None,
            save_path,
            state: TransferState::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            total_bytes: 0,
            download_rate: 0,
            upload_rate: 0,
            peers: 0,
            seeds: 0,
            eta_seconds: None,
            has_metadata: false,
            files: Vec::new(),
            manually_stopped: false,
            visible: true,
            last_error: None,
            added_at: Utc::now(),
            registered: true,
            pending_selection: None,
        }
    }

    pub fn with_display_name(mut self, name: Option<&str>) -> Self {
        if let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) {
            self.display_name = name.to_string();
        }
        self
    }

    /// True once every wanted byte is on disk.
    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
            || matches!(
                self.state,
                TransferState::Completed | TransferState::Seeding
            )
    }

    /// Whether the engine currently tracks this transfer. Records restored
    /// inactive or failed are not registered until resumed.
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Folds one engine status read into the record.
    ///
    /// Completed and manually stopped records are left untouched; only the
    /// stop and resume commands may move them.
    pub(crate) fn apply_status(&mut self, status: &EngineStatus) {
        if self.state == TransferState::Completed || self.manually_stopped {
            return;
        }

        let next = TransferState::from_engine(status, self.manually_stopped);
        let progress = clamp_progress(status.progress);
        self.progress = if self.state.is_transferring() && next.is_transferring() {
            self.progress.max(progress)
        } else {
            progress
        };
        self.state = next;

        if let Some(name) = status.name.as_deref().filter(|name| !name.is_empty()) {
            self.display_name = name.to_string();
        }
        if status.total_wanted > 0 {
            self.total_bytes = status.total_wanted;
        }
        self.downloaded_bytes = status.total_wanted_done;
        self.uploaded_bytes = status.total_uploaded;
        self.download_rate = status.download_rate;
        self.upload_rate = status.upload_rate;
        self.peers = status.peers;
        self.seeds = status.seeds;
        self.last_error = status.error.clone();
        self.eta_seconds = self.estimate_eta(status);
    }

    fn estimate_eta(&self, status: &EngineStatus) -> Option<u64> {
        if matches!(self.state, TransferState::Completed | TransferState::Seeding) {
            return Some(0);
        }
        let remaining = status.total_wanted.saturating_sub(status.total_wanted_done);
        if status.has_metadata && status.total_wanted > 0 && remaining == 0 {
            return Some(0);
        }
        if status.download_rate == 0 {
            return None;
        }
        Some(remaining.div_ceil(status.download_rate))
    }

    /// Number of manifest slots, counting entries skipped as unreadable.
    pub fn manifest_len(&self) -> usize {
        self.files
            .iter()
            .map(|file| file.index + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn has_file(&self, index: usize) -> bool {
        self.files.iter().any(|file| file.index == index)
    }

    /// Replaces the file list wholesale; an empty read never clears a
    /// populated list.
    pub(crate) fn replace_files(&mut self, files: Vec<FileEntry>) {
        if files.is_empty() {
            return;
        }
        self.files = files;
        self.has_metadata = true;
    }

    /// Updates per-file downloaded bytes from an engine progress read.
    pub(crate) fn apply_file_progress(&mut self, progress: &[u64]) {
        for file in &mut self.files {
            if let Some(done) = progress.get(file.index) {
                file.downloaded_bytes = (*done).min(file.size_bytes);
            }
        }
    }

    /// Marks the record stopped by the user.
    ///
    /// A finished transfer becomes `Completed` rather than `Stopped`.
    pub(crate) fn mark_stopped(&mut self) {
        self.state = if self.is_complete() {
            TransferState::Completed
        } else {
            TransferState::Stopped
        };
        self.manually_stopped = true;
        self.clear_rates();
    }

    pub(crate) fn mark_error(&mut self, reason: impl Into<String>) {
        self.state = TransferState::Error;
        self.last_error = Some(reason.into());
        self.registered = false;
        self.clear_rates();
    }

    pub(crate) fn clear_rates(&mut self) {
        self.download_rate = 0;
        self.upload_rate = 0;
        self.peers = 0;
        self.seeds = 0;
        self.eta_seconds = None;
    }
}

/// Display name used until the engine reports the real one.
pub fn placeholder_name(id: &InfoHash) -> String {
    format!("Fetching metadata ({})", id.short())
}

fn clamp_progress(progress: f32) -> f32 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Result of an add: either a new record or the one already tracked under
/// the same fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    Added(TransferRecord),
    Existing(TransferRecord),
}

impl AddOutcome {
    pub fn record(&self) -> &TransferRecord {
        match self {
            Self::Added(record) | Self::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> TransferRecord {
        match self {
            Self::Added(record) | Self::Existing(record) => record,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Added(_))
    }
}
