//! Session manager command surface.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::listeners::{ListenerId, ListenerRegistry};
use super::reconcile::{self, ReconcileHandle};
use super::record::{AddOutcome, FileEntry, FilePriority, TransferRecord, TransferState};
use super::restore::{self, RestoreReport};
use super::SessionError;
use crate::config::UndertowConfig;
use crate::engine::{AddTransferParams, EngineError, EnginePriority, TransferEngine};
use crate::format::format_bytes;
use crate::storage::{ManifestEntry, StateStore};
use crate::torrent::{DiscoveredTorrent, InfoHash, TransferSource};

type SessionResult<T> = Result<T, SessionError>;

/// Outcome of one persistence flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub manifest_saved: bool,
    pub resume_blobs_saved: usize,
    pub descriptors_cached: usize,
    pub engine_state_saved: bool,
    pub failures: usize,
}

/// State shared between the command surface and the reconciliation loop.
pub(crate) struct SessionInner {
    pub(crate) config: UndertowConfig,
    pub(crate) engine: Arc<dyn TransferEngine>,
    pub(crate) store: StateStore,
    pub(crate) records: RwLock<HashMap<InfoHash, TransferRecord>>,
    pub(crate) listeners: ListenerRegistry,
    shutting_down: AtomicBool,
    /// Serializes adds so two callers racing on one fingerprint see one record.
    add_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    /// Held from snapshot to rename so the newest manifest always lands last.
    manifest_lock: Mutex<()>,
}

/// Owns every transfer record and the background reconciliation loop.
///
/// All record mutations happen under one lock; callers only ever receive
/// copies. Engine calls are made with the lock released.
pub struct SessionManager {
    inner: Arc<SessionInner>,
    reconciler: parking_lot::Mutex<Option<ReconcileHandle>>,
    restore_report: RestoreReport,
}

impl SessionManager {
    /// Opens the session: prepares the state directory, restores global
    /// engine state, applies bandwidth and queue settings and re-registers
    /// persisted transfers.
    ///
    /// The reconciliation loop is not started; call [`SessionManager::start`].
    ///
    /// # Errors
    ///
    /// - `SessionError::Storage` - State directory could not be created
    pub async fn open(
        config: UndertowConfig,
        engine: Arc<dyn TransferEngine>,
    ) -> SessionResult<Self> {
        let store = StateStore::new(config.storage.state_dir.clone());
        store.ensure_layout().await?;

        let inner = Arc::new(SessionInner {
            config,
            engine,
            store,
            records: RwLock::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
            shutting_down: AtomicBool::new(false),
            add_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            manifest_lock: Mutex::new(()),
        });

        match inner.store.read_engine_state().await {
            Ok(Some(state)) => {
                if let Err(e) = inner.engine.restore_global_state(&state).await {
                    warn!("Discarding saved engine state: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to read saved engine state: {}", e),
        }

        if let Err(e) = inner
            .engine
            .apply_settings(inner.config.engine.settings())
            .await
        {
            warn!("Engine refused session settings: {}", e);
        }

        let restore_report = restore::restore_session(&inner).await;
        info!(
            "Session opened at {}: {} restored, {} left inactive, {} failed",
            inner.store.root().display(),
            restore_report.restored,
            restore_report.inactive,
            restore_report.failed
        );

        Ok(Self {
            inner,
            reconciler: parking_lot::Mutex::new(None),
            restore_report,
        })
    }

    /// Starts the reconciliation loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut reconciler = self.reconciler.lock();
        if reconciler.is_none() && !self.is_shutting_down() {
            *reconciler = Some(ReconcileHandle::spawn(Arc::clone(&self.inner)));
        }
    }

    pub fn is_running(&self) -> bool {
        self.reconciler.lock().is_some()
    }

    pub fn restore_report(&self) -> &RestoreReport {
        &self.restore_report
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.inner.config
    }

    /// Adds a visible transfer.
    ///
    /// `selected_files` limits the download to those file indices; for a
    /// magnet the selection is applied once metadata arrives.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidSource` - Source could not be parsed
    /// - `SessionError::EngineRejected` - Engine refused the transfer
    /// - `SessionError::ShuttingDown` - Session is closing
    pub async fn add_transfer(
        &self,
        discovered: DiscoveredTorrent,
        selected_files: Option<Vec<usize>>,
    ) -> SessionResult<AddOutcome> {
        self.register_new(discovered, selected_files, true).await
    }

    /// Adds a hidden transfer awaiting file selection.
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::add_transfer`].
    pub async fn stage_transfer(&self, discovered: DiscoveredTorrent) -> SessionResult<AddOutcome> {
        self.register_new(discovered, None, false).await
    }

    async fn register_new(
        &self,
        discovered: DiscoveredTorrent,
        selected_files: Option<Vec<usize>>,
        visible: bool,
    ) -> SessionResult<AddOutcome> {
        self.ensure_accepting()?;
        let source = TransferSource::resolve(&discovered.source_uri).await?;
        let id = source.fingerprint();

        let add_guard = self.inner.add_lock.lock().await;
        if let Some(existing) = self.inner.records.read().await.get(&id) {
            info!("Transfer {} already tracked, not adding again", id);
            return Ok(AddOutcome::Existing(existing.clone()));
        }

        let save_path = self.inner.config.storage.download_dir.clone();
        let params = self
            .inner
            .params_for_source(&source, selected_files.as_deref(), save_path.clone());
        let engine_id = self
            .inner
            .engine
            .add_transfer(params)
            .await
            .map_err(|e| SessionError::EngineRejected {
                reason: e.to_string(),
            })?;
        if engine_id != id {
            warn!("Engine registered {} as {}", id, engine_id);
        }

        if let TransferSource::Descriptor { bytes, .. } = &source
            && let Err(e) = self.inner.store.write_descriptor(&id, bytes).await
        {
            warn!("Failed to cache descriptor for {}: {}", id, e);
        }

        let mut record = TransferRecord::new(id, Some(source.source_descriptor()), save_path)
            .with_display_name(source.display_name())
            .with_display_name(Some(discovered.name.as_str()));
        record.size_hint = discovered
            .size_hint
            .clone()
            .or_else(|| source.display_size().map(format_bytes));
        record.total_bytes = source.display_size().unwrap_or(0);
        record.visible = visible;
        record.state = match source {
            TransferSource::Magnet(_) => {
                record.pending_selection = selected_files;
                TransferState::MetadataLoading
            }
            TransferSource::Descriptor { .. } => TransferState::Checking,
        };

        let outcome = match self.inner.records.write().await.entry(id) {
            Entry::Occupied(existing) => AddOutcome::Existing(existing.get().clone()),
            Entry::Vacant(slot) => AddOutcome::Added(slot.insert(record).clone()),
        };
        drop(add_guard);

        info!(
            "Added transfer {} ({}){}",
            id,
            outcome.record().display_name,
            if visible { "" } else { " awaiting file selection" }
        );
        self.inner.persist_and_notify().await;
        Ok(outcome)
    }

    /// Waits until the file manifest of `id` is known.
    ///
    /// Abandoning the wait does not stop the transfer; calling this again
    /// is the way to retry.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id, or removed while waiting
    /// - `SessionError::MetadataTimeout` - No manifest within `timeout`
    pub async fn wait_for_metadata(
        &self,
        id: InfoHash,
        timeout: Option<Duration>,
    ) -> SessionResult<Vec<FileEntry>> {
        let timeout = timeout.unwrap_or(self.inner.config.session.metadata_timeout);

        tokio::time::timeout(timeout, self.poll_metadata(id))
            .await
            .map_err(|_| SessionError::MetadataTimeout {
                id,
                waited: timeout,
            })?
    }

    async fn poll_metadata(&self, id: InfoHash) -> SessionResult<Vec<FileEntry>> {
        let poll_interval = self.inner.config.session.metadata_poll_interval;
        loop {
            let record = self.inner.snapshot(id).await?;
            if record.has_metadata && !record.files.is_empty() {
                return Ok(record.files);
            }
            if record.registered
                && let Some(files) = reconcile::read_files(self.inner.engine.as_ref(), id).await
            {
                return Ok(self.inner.install_files(id, files).await);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Applies a file selection to a staged transfer and makes it visible.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    /// - `SessionError::MetadataPending` - File manifest not known yet
    /// - `SessionError::EmptySelection` / `InvalidFileIndex` - Bad selection
    /// - `SessionError::Engine` - A priority change failed
    pub async fn confirm_selection(
        &self,
        id: InfoHash,
        selected: &[usize],
    ) -> SessionResult<TransferRecord> {
        self.ensure_accepting()?;
        let record = self.inner.snapshot(id).await?;
        if !record.has_metadata || record.files.is_empty() {
            return Err(SessionError::MetadataPending { id });
        }
        if selected.is_empty() {
            return Err(SessionError::EmptySelection { id });
        }
        if let Some(&index) = selected.iter().find(|&&index| !record.has_file(index)) {
            return Err(SessionError::InvalidFileIndex {
                id,
                index,
                file_count: record.files.len(),
            });
        }

        let priorities = selection_priorities(record.manifest_len(), selected);
        self.inner.apply_priorities(id, &priorities).await?;

        let confirmed = self
            .inner
            .update(id, |record| {
                record.visible = true;
                record.pending_selection = None;
            })
            .await?;
        info!("Confirmed {} of {} files for {}", selected.len(), priorities.len(), id);
        self.inner.persist_and_notify().await;
        Ok(confirmed)
    }

    /// Removes a transfer that is still awaiting selection, deleting its
    /// partial data. Returns false for visible transfers, which are left
    /// alone.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    pub async fn discard_staged(&self, id: InfoHash) -> SessionResult<bool> {
        let record = self.inner.snapshot(id).await?;
        if record.visible {
            return Ok(false);
        }
        self.remove(id, true).await?;
        Ok(true)
    }

    /// Pauses a transfer. Returns false when there was nothing to pause.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    /// - `SessionError::Engine` - Engine call failed
    pub async fn pause(&self, id: InfoHash) -> SessionResult<bool> {
        self.ensure_accepting()?;
        let record = self.inner.snapshot(id).await?;
        if record.manually_stopped
            || !record.registered
            || matches!(
                record.state,
                TransferState::Paused | TransferState::Stopped | TransferState::Completed
            )
        {
            debug!("Pause of {} in state {} is a no-op", id, record.state);
            return Ok(false);
        }

        let engine = self.inner.engine.as_ref();
        engine
            .set_auto_managed(id, false)
            .await
            .map_err(SessionError::engine(id))?;
        engine.pause(id).await.map_err(SessionError::engine(id))?;

        self.inner
            .update(id, |record| {
                record.state = TransferState::Paused;
                record.clear_rates();
            })
            .await?;
        info!("Paused {}", id);
        self.inner.persist_and_notify().await;
        Ok(true)
    }

    /// Resumes a paused, stopped or failed transfer.
    ///
    /// A transfer the user stopped, or one that failed, is re-verified
    /// first and passes through `Checking`. Transfers that are no longer
    /// registered with the engine are registered again from their persisted
    /// state. Returns false when there was nothing to resume.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    /// - `SessionError::InvalidSource` / `EngineRejected` - Re-registration failed
    /// - `SessionError::Engine` - Engine call failed
    pub async fn resume(&self, id: InfoHash) -> SessionResult<bool> {
        self.ensure_accepting()?;
        let record = self.inner.snapshot(id).await?;
        if record.state == TransferState::Completed && !record.manually_stopped {
            return Ok(false);
        }
        if record.registered
            && !record.manually_stopped
            && matches!(
                record.state,
                TransferState::Downloading
                    | TransferState::Seeding
                    | TransferState::MetadataLoading
                    | TransferState::Checking
                    | TransferState::Allocating
            )
        {
            return Ok(false);
        }

        if !record.registered {
            if let Err(e) = restore::register_persisted(&self.inner, &record, false).await {
                let reason = e.to_string();
                let _ = self
                    .inner
                    .update(id, |record| record.mark_error(reason))
                    .await;
                self.inner.persist_and_notify().await;
                return Err(e);
            }
            self.inner.update(id, |record| record.registered = true).await?;
        }

        let recheck = record.manually_stopped
            || record.state == TransferState::Error
            || !record.registered;
        let engine = self.inner.engine.as_ref();
        if recheck {
            engine
                .force_recheck(id)
                .await
                .map_err(SessionError::engine(id))?;
        }
        engine
            .set_auto_managed(id, true)
            .await
            .map_err(SessionError::engine(id))?;
        engine.resume(id).await.map_err(SessionError::engine(id))?;

        let status = if recheck {
            None
        } else {
            engine.status(id).await.ok()
        };
        self.inner
            .update(id, |record| {
                record.manually_stopped = false;
                record.last_error = None;
                record.state = if recheck {
                    TransferState::Checking
                } else {
                    TransferState::Queued
                };
                if let Some(status) = &status {
                    record.apply_status(status);
                }
            })
            .await?;
        info!("Resumed {}{}", id, if recheck { " with recheck" } else { "" });
        self.inner.persist_and_notify().await;
        Ok(true)
    }

    /// Stops a transfer on behalf of the user.
    ///
    /// The reconciliation loop will not restart a stopped transfer. Stopping
    /// a finished transfer leaves it `Completed`; stopping an already
    /// completed one returns false.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    /// - `SessionError::Engine` - Engine call failed
    pub async fn stop(&self, id: InfoHash) -> SessionResult<bool> {
        self.ensure_accepting()?;
        let record = self.inner.snapshot(id).await?;
        if record.state == TransferState::Completed
            || (record.manually_stopped && record.state == TransferState::Stopped)
        {
            return Ok(false);
        }

        if record.registered {
            let engine = self.inner.engine.as_ref();
            engine
                .set_auto_managed(id, false)
                .await
                .map_err(SessionError::engine(id))?;
            engine.pause(id).await.map_err(SessionError::engine(id))?;
        }

        let stopped = self.inner.update(id, TransferRecord::mark_stopped).await?;
        if stopped.registered && stopped.has_metadata {
            self.inner.save_resume_blob(id).await;
        }
        info!("Stopped {} ({})", id, stopped.state);
        self.inner.persist_and_notify().await;
        Ok(true)
    }

    /// Removes a transfer and its persisted state, optionally deleting the
    /// downloaded data.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    /// - `SessionError::Engine` - Engine refused the removal
    pub async fn remove(&self, id: InfoHash, delete_files: bool) -> SessionResult<()> {
        self.ensure_accepting()?;
        let record = self.inner.snapshot(id).await?;

        if record.registered {
            match self.inner.engine.remove_transfer(id, delete_files).await {
                Ok(()) | Err(EngineError::UnknownTransfer { .. }) => {}
                Err(e) => return Err(SessionError::Engine { id, error: e }),
            }
        } else if delete_files {
            warn!(
                "{} is not active in the engine, downloaded data left in {}",
                id,
                record.save_path.display()
            );
        }

        self.inner.records.write().await.remove(&id);
        if let Err(e) = self.inner.store.delete_transfer_state(&id).await {
            warn!("Failed to delete persisted state for {}: {}", id, e);
        }

        info!("Removed {} (delete_files={})", id, delete_files);
        self.inner.persist_and_notify().await;
        Ok(())
    }

    /// Removes every visible completed transfer, keeping downloaded data.
    ///
    /// Returns the ids that were removed.
    pub async fn remove_completed(&self) -> SessionResult<Vec<InfoHash>> {
        let completed: Vec<InfoHash> = self
            .inner
            .records
            .read()
            .await
            .values()
            .filter(|record| record.visible && record.state == TransferState::Completed)
            .map(|record| record.id)
            .collect();

        let mut removed = Vec::with_capacity(completed.len());
        for id in completed {
            match self.remove(id, false).await {
                Ok(()) => removed.push(id),
                Err(SessionError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Sets one file's priority. Makes exactly one engine call.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    /// - `SessionError::NotRegistered` - Transfer is not active in the engine
    /// - `SessionError::InvalidFileIndex` - No such file
    /// - `SessionError::AlreadyCompleted` - Would make an unfinished file of a
    ///   completed transfer wanted again
    /// - `SessionError::Engine` - Engine call failed
    pub async fn set_file_priority(
        &self,
        id: InfoHash,
        index: usize,
        priority: FilePriority,
    ) -> SessionResult<()> {
        self.ensure_accepting()?;
        let record = self.inner.snapshot(id).await?;
        if !record.registered {
            return Err(SessionError::NotRegistered { id });
        }
        let Some(file) = record.files.iter().find(|file| file.index == index) else {
            return Err(SessionError::InvalidFileIndex {
                id,
                index,
                file_count: record.files.len(),
            });
        };
        // Completed records are no longer reconciled, so the engine must not
        // be sent back to downloading behind a frozen record.
        if record.state == TransferState::Completed
            && priority != FilePriority::Skip
            && file.downloaded_bytes < file.size_bytes
        {
            return Err(SessionError::AlreadyCompleted { id, index });
        }

        self.inner
            .engine
            .set_file_priority(id, index, priority.to_engine())
            .await
            .map_err(SessionError::engine(id))?;

        self.inner
            .update(id, |record| {
                if let Some(file) = record.files.iter_mut().find(|file| file.index == index) {
                    file.priority = priority;
                }
            })
            .await?;
        debug!("Set priority of file {} of {} to {}", index, id, priority);
        self.inner.notify().await;
        Ok(())
    }

    /// Copies of every visible transfer, oldest first.
    pub async fn list_transfers(&self) -> Vec<TransferRecord> {
        visible_snapshot(&*self.inner.records.read().await)
    }

    /// Copy of one transfer, hidden ones included.
    pub async fn transfer(&self, id: InfoHash) -> Option<TransferRecord> {
        self.inner.records.read().await.get(&id).cloned()
    }

    /// File list of one transfer; empty until metadata is known.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    pub async fn files(&self, id: InfoHash) -> SessionResult<Vec<FileEntry>> {
        Ok(self.inner.snapshot(id).await?.files)
    }

    /// Shows or hides a transfer in listings.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotFound` - Unknown id
    pub async fn set_visible(&self, id: InfoHash, visible: bool) -> SessionResult<()> {
        self.inner
            .update(id, |record| record.visible = visible)
            .await?;
        self.inner.persist_and_notify().await;
        Ok(())
    }

    pub fn register_listener(
        &self,
        listener: impl Fn(&[TransferRecord]) + Send + Sync + 'static,
    ) -> ListenerId {
        self.inner.listeners.register(listener)
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.unregister(id)
    }

    /// Runs one reconciliation tick immediately.
    pub async fn reconcile_now(&self) {
        reconcile::tick(&self.inner).await;
    }

    /// Runs one persistence flush immediately.
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush().await
    }

    /// Stops the loop, flushes state and releases the engine.
    ///
    /// Every step is bounded by the configured shutdown grace period, so
    /// this returns even when the engine hangs. Later commands fail with
    /// `SessionError::ShuttingDown`.
    pub async fn shutdown(&self) -> FlushReport {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return FlushReport::default();
        }
        let grace = self.inner.config.session.shutdown_grace;

        let reconciler = self.reconciler.lock().take();
        if let Some(reconciler) = reconciler {
            reconciler.stop(grace).await;
        }

        let report = match tokio::time::timeout(grace, self.inner.flush()).await {
            Ok(report) => report,
            Err(_) => {
                warn!("Final flush did not finish within {:?}", grace);
                FlushReport {
                    failures: 1,
                    ..Default::default()
                }
            }
        };

        match tokio::time::timeout(grace, self.inner.engine.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Engine shutdown failed: {}", e),
            Err(_) => warn!("Engine did not shut down within {:?}, abandoning it", grace),
        }

        info!(
            "Session closed: {} resume blobs saved, {} failures",
            report.resume_blobs_saved, report.failures
        );
        report
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> SessionResult<()> {
        if self.is_shutting_down() {
            Err(SessionError::ShuttingDown)
        } else {
            Ok(())
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(reconciler) = self.reconciler.get_mut().take() {
            reconciler.abort();
        }
    }
}

impl SessionInner {
    /// Copy of one record.
    pub(crate) async fn snapshot(&self, id: InfoHash) -> SessionResult<TransferRecord> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound { id })
    }

    /// Mutates one record under the lock and returns a copy of the result.
    pub(crate) async fn update(
        &self,
        id: InfoHash,
        mutate: impl FnOnce(&mut TransferRecord),
    ) -> SessionResult<TransferRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or(SessionError::NotFound { id })?;
        mutate(record);
        Ok(record.clone())
    }

    /// Engine parameters for registering `source`.
    pub(crate) fn params_for_source(
        &self,
        source: &TransferSource,
        selected_files: Option<&[usize]>,
        save_path: PathBuf,
    ) -> AddTransferParams {
        let mut params = AddTransferParams {
            info_hash: Some(source.fingerprint()),
            name: source.display_name().map(str::to_string),
            trackers: source.trackers().to_vec(),
            save_path,
            auto_managed: true,
            max_connections: self.config.engine.max_connections_per_transfer,
            ..Default::default()
        };

        match source {
            TransferSource::Magnet(magnet) => {
                params.magnet_uri = Some(magnet.uri.clone());
                params.append_trackers(&self.config.engine.fallback_trackers);
            }
            TransferSource::Descriptor {
                bytes, metadata, ..
            } => {
                params.descriptor = Some(bytes.clone());
                if let Some(selected) = selected_files {
                    params.file_priorities =
                        Some(selection_priorities(metadata.files.len(), selected));
                }
            }
        }
        params
    }

    /// Installs a freshly read file list and returns the record's files.
    pub(crate) async fn install_files(
        &self,
        id: InfoHash,
        files: Vec<FileEntry>,
    ) -> Vec<FileEntry> {
        let mut records = self.records.write().await;
        match records.get_mut(&id) {
            Some(record) => {
                record.replace_files(files);
                record.files.clone()
            }
            None => files,
        }
    }

    /// Sends one priority per file to the engine and mirrors them in the
    /// record.
    pub(crate) async fn apply_priorities(
        &self,
        id: InfoHash,
        priorities: &[EnginePriority],
    ) -> SessionResult<()> {
        for (index, priority) in priorities.iter().enumerate() {
            self.engine
                .set_file_priority(id, index, *priority)
                .await
                .map_err(SessionError::engine(id))?;
        }

        self.update(id, |record| {
            for file in &mut record.files {
                if let Some(priority) = priorities.get(file.index) {
                    file.priority = FilePriority::from_engine(*priority);
                }
            }
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn notify(&self) {
        let snapshot = visible_snapshot(&*self.records.read().await);
        self.listeners.notify(&snapshot);
    }

    pub(crate) async fn persist_and_notify(&self) {
        self.save_manifest().await;
        self.notify().await;
    }

    /// Writes the manifest of visible transfers. Failures are logged and
    /// retried on the next flush.
    pub(crate) async fn save_manifest(&self) -> bool {
        let _manifest_guard = self.manifest_lock.lock().await;
        let entries: Vec<ManifestEntry> = visible_snapshot(&*self.records.read().await)
            .iter()
            .map(ManifestEntry::from)
            .collect();

        match self.store.save(&entries).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to save manifest: {}", e);
                false
            }
        }
    }

    /// Asks the engine for resume data and writes it. The engine call is
    /// bounded by `engine_call_timeout`.
    pub(crate) async fn save_resume_blob(&self, id: InfoHash) -> bool {
        let call_timeout = self.config.session.engine_call_timeout;
        match tokio::time::timeout(call_timeout, self.engine.save_resume_blob(id)).await {
            Ok(Ok(blob)) => match self.store.write_resume_blob(&id, &blob).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to write resume data for {}: {}", id, e);
                    false
                }
            },
            Ok(Err(e)) => {
                warn!("Engine could not produce resume data for {}: {}", id, e);
                false
            }
            Err(_) => {
                warn!("Resume data for {} not produced within {:?}", id, call_timeout);
                false
            }
        }
    }

    /// Caches the engine's descriptor for `id` if one is not cached yet.
    /// Returns `Some(true)` when one was written, `Some(false)` on failure.
    async fn cache_descriptor(&self, id: InfoHash) -> Option<bool> {
        if self.store.has_descriptor(&id).await {
            return None;
        }
        let call_timeout = self.config.session.engine_call_timeout;
        match tokio::time::timeout(call_timeout, self.engine.export_descriptor(id)).await {
            Ok(Ok(Some(descriptor))) => match self.store.write_descriptor(&id, &descriptor).await {
                Ok(()) => Some(true),
                Err(e) => {
                    warn!("Failed to cache descriptor for {}: {}", id, e);
                    Some(false)
                }
            },
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!("No descriptor for {}: {}", id, e);
                None
            }
            Err(_) => {
                warn!("Descriptor export for {} not done within {:?}", id, call_timeout);
                Some(false)
            }
        }
    }

    /// Durable flush of the manifest, engine state, resume blobs and
    /// descriptors, in that order.
    ///
    /// Best effort: each failure is logged and counted, none stops the rest.
    /// Every engine call is bounded by `engine_call_timeout`, so one stuck
    /// transfer cannot hold up the others or the session-wide state.
    pub(crate) async fn flush(&self) -> FlushReport {
        let _flush_guard = self.flush_lock.lock().await;
        let mut report = FlushReport::default();
        let call_timeout = self.config.session.engine_call_timeout;

        report.manifest_saved = self.save_manifest().await;
        if !report.manifest_saved {
            report.failures += 1;
        }

        match tokio::time::timeout(call_timeout, self.engine.global_state()).await {
            Ok(Ok(state)) => match self.store.write_engine_state(&state).await {
                Ok(()) => report.engine_state_saved = true,
                Err(e) => {
                    warn!("Failed to write engine state: {}", e);
                    report.failures += 1;
                }
            },
            Ok(Err(e)) => {
                warn!("Engine could not export its state: {}", e);
                report.failures += 1;
            }
            Err(_) => {
                warn!("Engine state not exported within {:?}", call_timeout);
                report.failures += 1;
            }
        }

        let resumable: Vec<InfoHash> = self
            .records
            .read()
            .await
            .values()
            .filter(|record| {
                record.registered
                    && record.has_metadata
                    && !matches!(
                        record.state,
                        TransferState::Checking
                            | TransferState::Allocating
                            | TransferState::MetadataLoading
                    )
            })
            .map(|record| record.id)
            .collect();

        let saved = join_all(resumable.iter().map(|id| self.save_resume_blob(*id))).await;
        report.resume_blobs_saved = saved.iter().filter(|saved| **saved).count();
        report.failures += saved.len() - report.resume_blobs_saved;

        let cached = join_all(resumable.iter().map(|id| self.cache_descriptor(*id))).await;
        for written in cached.into_iter().flatten() {
            if written {
                report.descriptors_cached += 1;
            } else {
                report.failures += 1;
            }
        }

        debug!(
            "Flush: {} resume blobs, {} descriptors, {} failures",
            report.resume_blobs_saved, report.descriptors_cached, report.failures
        );
        report
    }
}

/// Visible records in insertion order.
pub(crate) fn visible_snapshot(records: &HashMap<InfoHash, TransferRecord>) -> Vec<TransferRecord> {
    let mut visible: Vec<TransferRecord> = records
        .values()
        .filter(|record| record.visible)
        .cloned()
        .collect();
    visible.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
    visible
}

/// Normal for selected indices, skip for the rest.
pub(crate) fn selection_priorities(file_count: usize, selected: &[usize]) -> Vec<EnginePriority> {
    (0..file_count)
        .map(|index| {
            if selected.contains(&index) {
                EnginePriority::NORMAL
            } else {
                EnginePriority::SKIP
            }
        })
        .collect()
}
