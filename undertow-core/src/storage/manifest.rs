//! Durable manifest of known transfers.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{TransferRecord, TransferState};
use crate::torrent::InfoHash;

/// Current on-disk manifest format.
pub const MANIFEST_VERSION: u32 = 1;

/// Durable projection of one transfer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: InfoHash,
    pub name: String,
    pub source_uri: Option<String>,
    pub save_path: PathBuf,
    pub stopped: bool,
    pub status: TransferState,
    pub progress: f32,
    pub total_bytes: u64,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default = "Utc::now")]
    pub added_at: DateTime<Utc>,
}

impl From<&TransferRecord> for ManifestEntry {
    fn from(record: &TransferRecord) -> Self {
        Self {
            id: record.id,
            name: record.display_name.clone(),
            source_uri: record.source_uri.clone(),
            save_path: record.save_path.clone(),
            stopped: record.manually_stopped,
            status: record.state,
            progress: record.progress,
            total_bytes: record.total_bytes,
            downloaded_bytes: record.downloaded_bytes,
            added_at: record.added_at,
        }
    }
}

impl ManifestEntry {
    /// Rebuilds a record carrying the last-known fields of this entry.
    ///
    /// The record starts unregistered; the restore path flips that once the
    /// engine accepts it.
    pub fn to_record(&self) -> TransferRecord {
        let mut record = TransferRecord::new(self.id, self.source_uri.clone(), self.save_path.clone())
            .with_display_name(Some(self.name.as_str()));
        record.state = self.status;
        record.manually_stopped = self.stopped;
        record.progress = self.progress.clamp(0.0, 1.0);
        record.total_bytes = self.total_bytes;
        record.downloaded_bytes = self.downloaded_bytes;
        record.added_at = self.added_at;
        record.registered = false;
        record
    }
}

/// The manifest file as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub transfers: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(transfers: Vec<ManifestEntry>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            saved_at: Utc::now(),
            transfers,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn state_strategy() -> impl Strategy<Value = TransferState> {
        prop_oneof![
            Just(TransferState::Queued),
            Just(TransferState::Downloading),
            Just(TransferState::Seeding),
            Just(TransferState::Completed),
            Just(TransferState::Paused),
            Just(TransferState::Stopped),
            Just(TransferState::Error),
        ]
    }

    fn entry_strategy() -> impl Strategy<Value = ManifestEntry> {
        (
            any::<[u8; 20]>(),
            "[a-zA-Z0-9 ._-]{0,24}",
            proptest::option::of("magnet:\\?xt=urn:btih:[0-9a-f]{40}"),
            "/[a-z]{1,8}(/[a-z]{1,8}){0,3}",
            any::<bool>(),
            state_strategy(),
            0.0f32..=1.0,
            any::<u64>(),
        )
            .prop_map(
                |(hash, name, source_uri, save_path, stopped, status, progress, total_bytes)| {
                    ManifestEntry {
                        id: InfoHash::new(hash),
                        name,
                        source_uri,
                        save_path: PathBuf::from(save_path),
                        stopped,
                        status,
                        progress,
                        total_bytes,
                        downloaded_bytes: 0,
                        added_at: Utc::now(),
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn test_manifest_serialization_round_trip(entries in proptest::collection::vec(entry_strategy(), 0..8)) {
            let json = serde_json::to_vec(&Manifest::new(entries.clone())).unwrap();
            let loaded: Manifest = serde_json::from_slice(&json).unwrap();

            prop_assert_eq!(loaded.version, MANIFEST_VERSION);
            prop_assert_eq!(loaded.transfers.len(), entries.len());
            for (loaded, original) in loaded.transfers.iter().zip(&entries) {
                prop_assert_eq!(loaded.id, original.id);
                prop_assert_eq!(&loaded.save_path, &original.save_path);
                prop_assert_eq!(loaded.stopped, original.stopped);
                prop_assert_eq!(loaded.status, original.status);
            }
        }
    }

    #[test]
    fn test_entry_record_projection() {
        let mut record = TransferRecord::new(
            InfoHash::new([3; 20]),
            Some("magnet:?xt=urn:btih:0303030303030303030303030303030303030303".to_string()),
            PathBuf::from("/downloads"),
        )
        .with_display_name(Some("Sample"));
        record.mark_stopped();

        let entry = ManifestEntry::from(&record);
        assert!(entry.stopped);
        assert_eq!(entry.status, TransferState::Stopped);

        let restored = entry.to_record();
        assert_eq!(restored.id, record.id);
        assert_eq!(restored.display_name, "Sample");
        assert!(restored.manually_stopped);
        assert!(!restored.registered);
    }

    #[test]
    fn test_older_entries_without_optional_fields_load() {
        let json = r#"{
            "id": "0303030303030303030303030303030303030303",
            "name": "Old",
            "source_uri": null,
            "save_path": "/downloads",
            "stopped": false,
            "status": "Downloading",
            "progress": 0.25,
            "total_bytes": 100
        }"#;
        let entry: ManifestEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.downloaded_bytes, 0);
        assert_eq!(entry.status, TransferState::Downloading);
    }
}
