//! Startup restore and lazy re-registration.
//!
//! A persisted transfer is registered with the engine from, in order: its
//! saved resume blob, its cached descriptor, its original source URI. A
//! transfer that cannot be registered stays in the session as `Error` with
//! its last-known fields so the user can retry or remove it.

use tracing::{debug, error, info, warn};

use super::SessionError;
use super::manager::SessionInner;
use super::record::{TransferRecord, TransferState};
use crate::engine::AddTransferParams;
use crate::torrent::TransferSource;

/// Counts from one startup restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Registered with the engine again
    pub restored: usize,
    /// Terminal entries kept without registering them
    pub inactive: usize,
    /// Entries that could not be registered and are now `Error`
    pub failed: usize,
}

pub(crate) async fn restore_session(inner: &SessionInner) -> RestoreReport {
    let entries = inner.store.load().await;
    let mut report = RestoreReport::default();

    for entry in entries {
        let mut record = entry.to_record();

        if entry.status.is_terminal() || entry.stopped {
            debug!("Keeping {} ({}) inactive", entry.id, entry.status);
            report.inactive += 1;
            inner.records.write().await.insert(record.id, record);
            continue;
        }

        let paused = entry.status == TransferState::Paused;
        match register_persisted(inner, &record, paused).await {
            Ok(()) => {
                record.registered = true;
                if paused {
                    record.state = TransferState::Paused;
                } else if entry.progress < 1.0 {
                    if let Err(e) = inner.engine.force_recheck(record.id).await {
                        warn!("Recheck of restored {} failed: {}", record.id, e);
                    } else {
                        record.state = TransferState::Checking;
                    }
                }
                info!("Restored {} ({})", record.id, record.display_name);
                report.restored += 1;
            }
            Err(e) => {
                error!("Failed to restore {}: {}", record.id, e);
                record.mark_error(e.to_string());
                report.failed += 1;
            }
        }

        inner.records.write().await.insert(record.id, record);
    }

    if report.failed > 0 {
        inner.save_manifest().await;
    }
    report
}

/// Registers a persisted transfer with the engine.
///
/// # Errors
///
/// - `SessionError::InvalidSource` - No usable resume blob, descriptor or source
/// - `SessionError::EngineRejected` - Engine refused the last fallback
pub(crate) async fn register_persisted(
    inner: &SessionInner,
    record: &TransferRecord,
    paused: bool,
) -> Result<(), SessionError> {
    let id = record.id;
    let engine = inner.engine.as_ref();
    let apply_common = |params: &mut AddTransferParams| {
        params.info_hash = Some(id);
        params.save_path = record.save_path.clone();
        params.paused = paused;
        params.auto_managed = !paused;
        params.max_connections = inner.config.engine.max_connections_per_transfer;
        if params.name.is_none() {
            params.name = Some(record.display_name.clone());
        }
    };

    match inner.store.read_resume_blob(&id).await {
        Ok(Some(blob)) => match engine.params_from_resume_blob(&blob).await {
            Ok(mut params) => {
                apply_common(&mut params);
                match engine.add_transfer(params.clone()).await {
                    Ok(_) => return Ok(()),
                    Err(e) => {
                        warn!("Resume data for {} rejected ({}), retrying without it", id, e);
                        params.resume_data = None;
                        if params.has_source() {
                            match engine.add_transfer(params).await {
                                Ok(_) => return Ok(()),
                                Err(e) => warn!("Registering {} without resume data failed: {}", id, e),
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Ignoring resume data for {}: {}", id, e),
        },
        Ok(None) => {}
        Err(e) => warn!("Failed to read resume data for {}: {}", id, e),
    }

    match inner.store.read_descriptor(&id).await {
        Ok(Some(descriptor)) => {
            let mut params = AddTransferParams {
                descriptor: Some(descriptor),
                ..Default::default()
            };
            apply_common(&mut params);
            match engine.add_transfer(params).await {
                Ok(_) => return Ok(()),
                Err(e) => warn!("Cached descriptor for {} rejected: {}", id, e),
            }
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to read cached descriptor for {}: {}", id, e),
    }

    let source_uri = record
        .source_uri
        .as_deref()
        .ok_or_else(|| SessionError::InvalidSource {
            reason: format!("No resume data, descriptor or source recorded for {id}"),
        })?;
    let source = TransferSource::resolve(source_uri).await?;
    if source.fingerprint() != id {
        return Err(SessionError::InvalidSource {
            reason: format!(
                "Source now resolves to {} instead of {}",
                source.fingerprint(),
                id
            ),
        });
    }

    let mut params = inner.params_for_source(&source, None, record.save_path.clone());
    apply_common(&mut params);
    engine
        .add_transfer(params)
        .await
        .map_err(|e| SessionError::EngineRejected {
            reason: e.to_string(),
        })?;
    Ok(())
}
