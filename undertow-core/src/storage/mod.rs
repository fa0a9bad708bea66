//! Persisted state store.
//!
//! Everything the session needs to survive a restart lives under one state
//! directory:
//!
//! ```text
//! <state_dir>/transfers.json          manifest
//! <state_dir>/resume/<id>.resume      per-transfer resume blobs
//! <state_dir>/descriptors/<id>.torrent cached descriptors
//! <state_dir>/engine_state.bin        global engine state
//! ```
//!
//! Every write goes to a temporary sibling first and is renamed into place,
//! so a crash mid-write leaves the previous version intact.

pub mod manifest;

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
pub use manifest::{MANIFEST_VERSION, Manifest, ManifestEntry};

use crate::torrent::InfoHash;

const MANIFEST_FILE: &str = "transfers.json";
const RESUME_DIR: &str = "resume";
const DESCRIPTOR_DIR: &str = "descriptors";
const ENGINE_STATE_FILE: &str = "engine_state.bin";
const TEMP_SUFFIX: &str = ".tmp";

/// Errors from the persisted state store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {}: {error}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to serialize manifest: {reason}")]
    Serialization { reason: String },
}

/// File-backed store for the manifest, resume blobs and engine state.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn resume_path(&self, id: &InfoHash) -> PathBuf {
        self.root.join(RESUME_DIR).join(format!("{id}.resume"))
    }

    pub fn descriptor_path(&self, id: &InfoHash) -> PathBuf {
        self.root.join(DESCRIPTOR_DIR).join(format!("{id}.torrent"))
    }

    pub fn engine_state_path(&self) -> PathBuf {
        self.root.join(ENGINE_STATE_FILE)
    }

    /// Creates the state directory layout.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - A directory could not be created
    pub async fn ensure_layout(&self) -> Result<(), StorageError> {
        for dir in [
            self.root.clone(),
            self.root.join(RESUME_DIR),
            self.root.join(DESCRIPTOR_DIR),
        ] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|error| StorageError::Io { path: dir, error })?;
        }
        Ok(())
    }

    /// Loads the manifest.
    ///
    /// Never fails: a missing file is an empty manifest, an unreadable or
    /// corrupt one is logged, moved aside to `transfers.json.corrupt` and
    /// treated as empty.
    pub async fn load(&self) -> Vec<ManifestEntry> {
        let path = self.manifest_path();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(error) => {
                tracing::warn!("Failed to read manifest {}: {}", path.display(), error);
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Manifest>(&bytes) {
            Ok(manifest) => {
                if manifest.version > MANIFEST_VERSION {
                    tracing::warn!(
                        "Manifest version {} is newer than supported {}, loading anyway",
                        manifest.version,
                        MANIFEST_VERSION
                    );
                }
                let mut seen = std::collections::HashSet::new();
                manifest
                    .transfers
                    .into_iter()
                    .filter(|entry| seen.insert(entry.id))
                    .collect()
            }
            Err(error) => {
                let aside = path.with_extension("json.corrupt");
                tracing::warn!(
                    "Manifest {} is corrupt ({}), moving it to {}",
                    path.display(),
                    error,
                    aside.display()
                );
                if let Err(error) = tokio::fs::rename(&path, &aside).await {
                    tracing::warn!("Failed to move corrupt manifest aside: {}", error);
                }
                Vec::new()
            }
        }
    }

    /// Replaces the manifest with `entries`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Serialization` - Entries could not be encoded
    /// - `StorageError::Io` - Temporary file could not be written or renamed
    pub async fn save(&self, entries: &[ManifestEntry]) -> Result<(), StorageError> {
        let manifest = Manifest::new(entries.to_vec());
        let bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|e| StorageError::Serialization {
                reason: e.to_string(),
            })?;
        write_atomic(&self.manifest_path(), &bytes).await
    }

    /// Reads a resume blob, `None` when none was saved.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Blob exists but could not be read
    pub async fn read_resume_blob(&self, id: &InfoHash) -> Result<Option<Bytes>, StorageError> {
        read_optional(&self.resume_path(id)).await
    }

    pub async fn write_resume_blob(&self, id: &InfoHash, blob: &[u8]) -> Result<(), StorageError> {
        write_atomic(&self.resume_path(id), blob).await
    }

    pub async fn delete_resume_blob(&self, id: &InfoHash) -> Result<(), StorageError> {
        remove_if_present(&self.resume_path(id)).await
    }

    /// Reads a cached descriptor, `None` when none was cached.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - Descriptor exists but could not be read
    pub async fn read_descriptor(&self, id: &InfoHash) -> Result<Option<Bytes>, StorageError> {
        read_optional(&self.descriptor_path(id)).await
    }

    pub async fn write_descriptor(&self, id: &InfoHash, descriptor: &[u8]) -> Result<(), StorageError> {
        write_atomic(&self.descriptor_path(id), descriptor).await
    }

    pub async fn has_descriptor(&self, id: &InfoHash) -> bool {
        tokio::fs::try_exists(self.descriptor_path(id))
            .await
            .unwrap_or(false)
    }

    pub async fn delete_descriptor(&self, id: &InfoHash) -> Result<(), StorageError> {
        remove_if_present(&self.descriptor_path(id)).await
    }

    pub async fn read_engine_state(&self) -> Result<Option<Bytes>, StorageError> {
        read_optional(&self.engine_state_path()).await
    }

    pub async fn write_engine_state(&self, state: &[u8]) -> Result<(), StorageError> {
        write_atomic(&self.engine_state_path(), state).await
    }

    /// Deletes every per-transfer file kept for `id`.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - A file exists but could not be removed
    pub async fn delete_transfer_state(&self, id: &InfoHash) -> Result<(), StorageError> {
        self.delete_resume_blob(id).await?;
        self.delete_descriptor(id).await
    }
}

async fn read_optional(path: &Path) -> Result<Option<Bytes>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(Bytes::from(bytes))),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(StorageError::Io {
            path: path.to_path_buf(),
            error,
        }),
    }
}

async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(StorageError::Io {
            path: path.to_path_buf(),
            error,
        }),
    }
}

/// Writes `bytes` to a uniquely named temporary sibling of `path`, then
/// renames it over `path`. Concurrent writers never share a temporary file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let target = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &bytes))
        .await
        .map_err(|error| StorageError::Io {
            path: path.to_path_buf(),
            error: std::io::Error::other(error),
        })?
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let io_error = |error: std::io::Error| StorageError::Io {
        path: path.to_path_buf(),
        error,
    };
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(io_error)?;

    let mut prefix = path.file_name().unwrap_or_default().to_os_string();
    prefix.push(".");
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .map_err(io_error)?;
    temp.write_all(bytes).map_err(io_error)?;
    temp.as_file().sync_data().map_err(io_error)?;
    temp.persist(path).map_err(|e| io_error(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TransferState;

    fn leftover_temp_files(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX))
            .count()
    }

    fn entry(byte: u8, stopped: bool) -> ManifestEntry {
        ManifestEntry {
            id: InfoHash::new([byte; 20]),
            name: format!("transfer-{byte}"),
            source_uri: None,
            save_path: PathBuf::from(format!("/downloads/{byte}")),
            stopped,
            status: TransferState::Downloading,
            progress: 0.5,
            total_bytes: 1000,
            downloaded_bytes: 500,
            added_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_missing_manifest_is_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("state"));
        let entries = vec![entry(1, false), entry(2, true)];

        store.save(&entries).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded.len(), 2);
        for (loaded, original) in loaded.iter().zip(&entries) {
            assert_eq!(loaded.id, original.id);
            assert_eq!(loaded.save_path, original.save_path);
            assert_eq!(loaded.stopped, original.stopped);
        }
        assert_eq!(leftover_temp_files(&temp_dir.path().join("state")), 0);
    }

    #[tokio::test]
    async fn test_concurrent_saves_all_succeed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let batches: Vec<Vec<ManifestEntry>> = (1..=16u8)
            .map(|count| (1..=count).map(|byte| entry(byte, false)).collect())
            .collect();

        for _ in 0..10 {
            let results =
                futures::future::join_all(batches.iter().map(|batch| store.save(batch))).await;
            assert!(results.iter().all(Result::is_ok));
            assert!(!store.load().await.is_empty());
        }

        assert!(!temp_dir.path().join("transfers.json.corrupt").exists());
        assert_eq!(leftover_temp_files(temp_dir.path()), 0);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_moved_aside() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        tokio::fs::write(store.manifest_path(), b"{ not json")
            .await
            .unwrap();

        assert!(store.load().await.is_empty());
        assert!(temp_dir.path().join("transfers.json.corrupt").exists());
        assert!(!store.manifest_path().exists());
    }

    #[tokio::test]
    async fn test_duplicate_ids_keep_first_entry() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let mut duplicate = entry(1, true);
        duplicate.name = "second".to_string();

        store.save(&[entry(1, false), duplicate]).await.unwrap();
        let loaded = store.load().await;

        assert_eq!(loaded.len(), 1);
        assert!(!loaded[0].stopped);
    }

    #[tokio::test]
    async fn test_resume_blob_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());
        let id = InfoHash::new([9; 20]);

        assert!(store.read_resume_blob(&id).await.unwrap().is_none());
        store.write_resume_blob(&id, b"resume").await.unwrap();
        assert_eq!(
            store.read_resume_blob(&id).await.unwrap().unwrap().as_ref(),
            b"resume"
        );

        store.write_descriptor(&id, b"d4:infode").await.unwrap();
        assert!(store.has_descriptor(&id).await);

        store.delete_transfer_state(&id).await.unwrap();
        assert!(store.read_resume_blob(&id).await.unwrap().is_none());
        assert!(store.read_descriptor(&id).await.unwrap().is_none());
        store.delete_resume_blob(&id).await.unwrap();
    }

    #[test]
    fn test_ensure_layout_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path().join("nested/state"));

        tokio_test::assert_ok!(tokio_test::block_on(store.ensure_layout()));
        assert!(temp_dir.path().join("nested/state/resume").is_dir());
        assert!(temp_dir.path().join("nested/state/descriptors").is_dir());
    }

    #[tokio::test]
    async fn test_engine_state_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(temp_dir.path());

        assert!(store.read_engine_state().await.unwrap().is_none());
        store.write_engine_state(b"{\"dht_nodes\":[]}").await.unwrap();
        assert!(store.read_engine_state().await.unwrap().is_some());
    }
}
