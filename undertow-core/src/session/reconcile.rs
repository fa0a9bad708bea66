//! Reconciliation loop.
//!
//! One background task per session. Every tick it reads live status for all
//! tracked transfers concurrently, folds the reads into the records under
//! the write lock, applies pending file selections and notifies listeners
//! exactly once. A slower cadence triggers the durable flush.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::manager::{SessionInner, selection_priorities, visible_snapshot};
use super::record::{FileEntry, TransferState};
use crate::engine::{EngineError, EngineStatus, TransferEngine};
use crate::torrent::InfoHash;

/// Running loop and the means to stop it.
pub(crate) struct ReconcileHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconcileHandle {
    pub(crate) fn spawn(inner: Arc<SessionInner>) -> Self {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run(inner, shutdown_rx));
        Self {
            shutdown: Some(shutdown),
            task,
        }
    }

    /// Signals the loop and waits up to `grace` for the current tick to end.
    pub(crate) async fn stop(mut self, grace: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("Reconciliation loop did not stop within {:?}, aborting it", grace);
            self.task.abort();
        }
    }

    pub(crate) fn abort(self) {
        self.task.abort();
    }
}

async fn run(inner: Arc<SessionInner>, mut shutdown: oneshot::Receiver<()>) {
    let session = &inner.config.session;
    let mut ticker = tokio::time::interval(session.reconcile_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut flush_ticker = tokio::time::interval_at(
        Instant::now() + session.flush_interval,
        session.flush_interval,
    );
    flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(
        "Reconciliation loop started: tick={:?}, flush={:?}",
        session.reconcile_interval, session.flush_interval
    );

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = flush_ticker.tick() => {
                inner.flush().await;
            }
            _ = ticker.tick() => tick(&inner).await,
        }
    }

    debug!("Reconciliation loop stopped");
}

/// Everything read from the engine for one transfer in one tick.
struct TransferRead {
    id: InfoHash,
    status: Result<EngineStatus, EngineError>,
    files: Option<Vec<FileEntry>>,
    file_progress: Option<Vec<u64>>,
}

/// One reconciliation pass.
pub(crate) async fn tick(inner: &SessionInner) {
    let targets: Vec<(InfoHash, bool)> = inner
        .records
        .read()
        .await
        .values()
        .filter(|record| {
            record.registered
                && !record.manually_stopped
                && record.state != TransferState::Completed
        })
        .map(|record| (record.id, !record.files.is_empty()))
        .collect();

    let engine = inner.engine.as_ref();
    let reads = join_all(
        targets
            .into_iter()
            .map(|(id, has_files)| read_transfer(engine, id, has_files)),
    )
    .await;

    let mut selections = Vec::new();
    {
        let mut records = inner.records.write().await;
        for read in reads {
            // Removed while the reads were in flight.
            let Some(record) = records.get_mut(&read.id) else {
                continue;
            };

            match read.status {
                Ok(status) => {
                    record.apply_status(&status);
                    if let Some(files) = read.files {
                        record.replace_files(files);
                    }
                    if let Some(progress) = read.file_progress {
                        record.apply_file_progress(&progress);
                    }
                }
                Err(EngineError::UnknownTransfer { .. }) => {
                    warn!("Engine no longer knows {}, marking it failed", read.id);
                    record.mark_error("Transfer is no longer registered with the engine");
                }
                Err(e) => debug!("Status read for {} failed: {}", read.id, e),
            }

            if !record.files.is_empty()
                && let Some(selected) = record.pending_selection.take()
            {
                selections.push((record.id, selection_priorities(record.manifest_len(), &selected)));
            }
        }
    }

    for (id, priorities) in selections {
        match inner.apply_priorities(id, &priorities).await {
            Ok(()) => debug!("Applied pending file selection to {}", id),
            Err(e) => warn!("Failed to apply file selection to {}: {}", id, e),
        }
    }

    let snapshot = visible_snapshot(&*inner.records.read().await);
    inner.listeners.notify(&snapshot);
}

async fn read_transfer(engine: &dyn TransferEngine, id: InfoHash, has_files: bool) -> TransferRead {
    let status = engine.status(id).await;
    let mut files = None;
    let mut file_progress = None;

    if let Ok(status) = &status
        && status.has_metadata
    {
        if !has_files {
            files = read_files(engine, id).await;
        }
        file_progress = engine.file_progress(id).await.ok();
    }

    TransferRead {
        id,
        status,
        files,
        file_progress,
    }
}

/// Reads the file manifest.
///
/// An unreadable first file means the metadata is not really there yet and
/// the whole read is discarded; later unreadable files are skipped.
pub(crate) async fn read_files(engine: &dyn TransferEngine, id: InfoHash) -> Option<Vec<FileEntry>> {
    let manifest = match engine.file_manifest(id).await {
        Ok(manifest) => manifest,
        Err(e) => {
            debug!("File manifest for {} unavailable: {}", id, e);
            return None;
        }
    };

    let mut files = Vec::with_capacity(manifest.len());
    for (position, read) in manifest.into_iter().enumerate() {
        match read {
            Ok(file) => files.push(FileEntry::from(file)),
            Err(e) if position == 0 => {
                debug!("First file of {} unreadable, retrying next tick: {}", id, e);
                return None;
            }
            Err(e) => warn!("Skipping unreadable file {} of {}: {}", position, id, e),
        }
    }

    (!files.is_empty()).then_some(files)
}
