//! In-process simulated engine.
//!
//! Deterministic stand-in for a real torrent engine. Nothing touches the
//! network: content is served from a catalog (or synthesized), progress
//! advances one step per `advance()` call, and resume blobs are JSON.
//! Faults can be injected to exercise the session manager's recovery paths.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use super::{
    AddTransferParams, EngineError, EngineFile, EnginePriority, EngineSettings, EngineState,
    EngineStatus, FileRead, TransferEngine,
};
use crate::config::SimulationConfig;
use crate::torrent::{DescriptorParser, InfoHash, MagnetParser};

const MAX_DHT_NODES: usize = 64;

/// Content the simulated swarm can serve metadata for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub files: Vec<(String, u64)>,
    pub descriptor: Option<Bytes>,
}

impl CatalogEntry {
    pub fn new(name: impl Into<String>, files: &[(&str, u64)]) -> Self {
        Self {
            name: name.into(),
            files: files
                .iter()
                .map(|(path, size)| (path.to_string(), *size))
                .collect(),
            descriptor: None,
        }
    }

    pub fn with_descriptor(mut self, descriptor: Bytes) -> Self {
        self.descriptor = Some(descriptor);
        self
    }
}

/// Failures the simulated engine should produce on demand.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    /// Refuse every `add_transfer`
    pub reject_adds: bool,
    /// Refuse `add_transfer` when resume data is supplied
    pub reject_resume_data: bool,
    /// Transfers whose status read fails
    pub failing_status: HashSet<InfoHash>,
    /// Number of upcoming manifest reads where file 0 is unreadable
    pub first_file_failures: u32,
    /// File indices that are always unreadable
    pub unreadable_files: HashSet<usize>,
    /// Delay before `shutdown` returns
    pub shutdown_delay: Option<Duration>,
}

/// Mutating calls received by the simulated engine, in order, including
/// ones it refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Add(InfoHash),
    Remove {
        info_hash: InfoHash,
        delete_files: bool,
    },
    Pause(InfoHash),
    Resume(InfoHash),
    SetAutoManaged(InfoHash, bool),
    ForceRecheck(InfoHash),
    SetFilePriority {
        info_hash: InfoHash,
        index: usize,
        priority: EnginePriority,
    },
    SaveResume(InfoHash),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SimulatedFile {
    path: String,
    size: u64,
    done: u64,
    priority: EnginePriority,
}

#[derive(Debug, Clone)]
struct SimulatedTransfer {
    name: Option<String>,
    magnet_uri: Option<String>,
    trackers: Vec<String>,
    save_path: PathBuf,
    files: Option<Vec<SimulatedFile>>,
    descriptor: Option<Bytes>,
    state: EngineState,
    paused: bool,
    auto_managed: bool,
    countdown: u32,
    uploaded: u64,
    error: Option<String>,
    pending_priorities: Option<Vec<EnginePriority>>,
    /// Position in the engine queue, lower starts first
    queue_position: u64,
}

/// Serialized form of a resume blob.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeRecord {
    info_hash: InfoHash,
    name: Option<String>,
    magnet_uri: Option<String>,
    trackers: Vec<String>,
    save_path: PathBuf,
    files: Option<Vec<SimulatedFile>>,
    uploaded: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GlobalState {
    dht_nodes: Vec<String>,
}

#[derive(Debug, Default)]
struct SimulatedSwarm {
    transfers: HashMap<InfoHash, SimulatedTransfer>,
    catalog: HashMap<InfoHash, CatalogEntry>,
    dht_nodes: Vec<String>,
    faults: FaultPlan,
    calls: Vec<EngineCall>,
    shut_down: bool,
    settings: EngineSettings,
    next_queue_position: u64,
}

impl SimulatedSwarm {
    /// Starts auto-managed transfers in queue order up to the active limits
    /// and pauses the rest. Transfers the user controls are left alone.
    fn apply_queue(&mut self) {
        let mut managed: Vec<(u64, InfoHash, bool)> = self
            .transfers
            .iter()
            .filter(|(_, transfer)| transfer.auto_managed && transfer.error.is_none())
            .map(|(info_hash, transfer)| {
                (transfer.queue_position, *info_hash, transfer.is_seed())
            })
            .collect();
        managed.sort();

        let mut active_downloads = 0;
        let mut active_seeds = 0;
        for (_, info_hash, seed) in managed {
            let (active, limit) = if seed {
                (&mut active_seeds, self.settings.max_active_seeds)
            } else {
                (&mut active_downloads, self.settings.max_active_downloads)
            };
            let admitted = limit.is_none_or(|limit| *active < limit);
            if admitted {
                *active += 1;
            }
            if let Some(transfer) = self.transfers.get_mut(&info_hash) {
                transfer.paused = !admitted;
            }
        }
    }

    /// Per-transfer download and upload budget for one step, splitting the
    /// session-wide limits across running transfers.
    fn rate_shares(&self, config: &SimulationConfig) -> (u64, u64) {
        let (downloading, uploading) =
            self.transfers
                .values()
                .fold((0u64, 0u64), |(down, up), transfer| {
                    if !transfer.is_running() {
                        (down, up)
                    } else if transfer.state == EngineState::Downloading {
                        (down + 1, up)
                    } else if transfer.is_seed() {
                        (down, up + 1)
                    } else {
                        (down, up)
                    }
                });

        let share = |limit: u64, running: u64, speed: u64| {
            if limit == 0 {
                speed
            } else {
                (limit / running.max(1)).clamp(1, speed.max(1))
            }
        };
        (
            share(
                self.settings.download_rate_limit,
                downloading,
                config.simulated_download_speed,
            ),
            share(
                self.settings.upload_rate_limit,
                uploading,
                config.simulated_upload_speed,
            ),
        )
    }
}

/// Deterministic in-process implementation of `TransferEngine`.
pub struct SimulatedEngine {
    config: SimulationConfig,
    swarm: Mutex<SimulatedSwarm>,
}

impl SimulatedEngine {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            swarm: Mutex::new(SimulatedSwarm::default()),
        }
    }

    /// Makes content available so magnet transfers for it can get metadata.
    pub fn publish(&self, info_hash: InfoHash, entry: CatalogEntry) {
        self.swarm.lock().catalog.insert(info_hash, entry);
    }

    pub fn set_faults(&self, faults: FaultPlan) {
        self.swarm.lock().faults = faults;
    }

    pub fn update_faults(&self, update: impl FnOnce(&mut FaultPlan)) {
        update(&mut self.swarm.lock().faults);
    }

    /// Advances every transfer by one step.
    ///
    /// A step moves countdowns forward and downloads
    /// `simulated_download_speed` bytes per active transfer.
    pub fn advance(&self) {
        let mut swarm = self.swarm.lock();
        swarm.apply_queue();
        let shares = swarm.rate_shares(&self.config);
        let SimulatedSwarm {
            transfers, catalog, ..
        } = &mut *swarm;

        for (info_hash, transfer) in transfers.iter_mut() {
            let content = catalog.get(info_hash).cloned().or_else(|| {
                self.config
                    .synthesize_metadata
                    .then(|| self.synthesize(info_hash, transfer.name.as_deref()))
            });
            transfer.step(&self.config, content, shares);
        }
    }

    pub fn advance_by(&self, steps: usize) {
        for _ in 0..steps {
            self.advance();
        }
    }

    /// Spawns a task that calls `advance` every `step_interval` until the
    /// engine shuts down or is dropped.
    pub fn start_clock(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let step_interval = self.config.step_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(step_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                if engine.is_shut_down() {
                    break;
                }
                engine.advance();
            }
        })
    }

    /// Marks every wanted byte of a transfer as downloaded.
    pub fn complete(&self, info_hash: InfoHash) {
        let mut swarm = self.swarm.lock();
        if let Some(transfer) = swarm.transfers.get_mut(&info_hash)
            && let Some(files) = transfer.files.as_mut()
        {
            for file in files.iter_mut().filter(|file| file.priority.is_wanted()) {
                file.done = file.size;
            }
            transfer.state = transfer.settled_state();
        }
    }

    /// Puts a transfer into an engine-reported error.
    pub fn fail_transfer(&self, info_hash: InfoHash, reason: impl Into<String>) {
        if let Some(transfer) = self.swarm.lock().transfers.get_mut(&info_hash) {
            transfer.error = Some(reason.into());
        }
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.swarm.lock().calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.swarm
            .lock()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    pub fn clear_calls(&self) {
        self.swarm.lock().calls.clear();
    }

    pub fn contains(&self, info_hash: InfoHash) -> bool {
        self.swarm.lock().transfers.contains_key(&info_hash)
    }

    pub fn transfer_count(&self) -> usize {
        self.swarm.lock().transfers.len()
    }

    pub fn dht_nodes(&self) -> Vec<String> {
        self.swarm.lock().dht_nodes.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.swarm.lock().shut_down
    }

    fn synthesize(&self, info_hash: &InfoHash, name: Option<&str>) -> CatalogEntry {
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("content-{}", info_hash.short()));
        let seed = self.config.deterministic_seed.unwrap_or(0);
        let file_count = 1 + (u64::from(info_hash.as_bytes()[0]) ^ seed) % 3;
        let file_size = (self.config.synthesized_size / file_count).max(1);

        CatalogEntry {
            files: (0..file_count)
                .map(|index| (format!("{name}/part-{index:02}.bin"), file_size))
                .collect(),
            name,
            descriptor: None,
        }
    }

    /// Runs `operation` against one registered transfer.
    fn with_transfer<T>(
        &self,
        info_hash: InfoHash,
        call: Option<EngineCall>,
        operation: impl FnOnce(&mut SimulatedTransfer) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let mut swarm = self.swarm.lock();
        if swarm.shut_down {
            return Err(EngineError::Shutdown);
        }
        let transfer = swarm
            .transfers
            .get_mut(&info_hash)
            .ok_or(EngineError::UnknownTransfer { info_hash })?;
        let result = operation(transfer)?;
        if let Some(call) = call {
            swarm.calls.push(call);
        }
        Ok(result)
    }

    fn ensure_running(swarm: &SimulatedSwarm) -> Result<(), EngineError> {
        if swarm.shut_down {
            Err(EngineError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl SimulatedTransfer {
    fn is_running(&self) -> bool {
        !self.paused && self.error.is_none()
    }

    fn is_seed(&self) -> bool {
        matches!(self.state, EngineState::Finished | EngineState::Seeding)
    }

    fn step(
        &mut self,
        config: &SimulationConfig,
        content: Option<CatalogEntry>,
        (download_share, upload_share): (u64, u64),
    ) {
        if self.paused || self.error.is_some() {
            return;
        }

        match self.state {
            EngineState::DownloadingMetadata => {
                if self.countdown > 1 {
                    self.countdown -= 1;
                    return;
                }
                if let Some(content) = content {
                    self.install_metadata(content);
                    self.state = self.settled_state();
                }
            }
            EngineState::CheckingFiles
            | EngineState::CheckingResumeData
            | EngineState::Allocating => {
                if self.countdown > 1 {
                    self.countdown -= 1;
                    return;
                }
                self.state = if self.files.is_some() {
                    self.settled_state()
                } else {
                    self.countdown = config.metadata_delay_steps;
                    EngineState::DownloadingMetadata
                };
            }
            EngineState::Downloading => {
                let mut budget = download_share;
                if let Some(files) = self.files.as_mut() {
                    for file in files.iter_mut().filter(|file| file.priority.is_wanted()) {
                        let take = (file.size - file.done).min(budget);
                        file.done += take;
                        budget -= take;
                        if budget == 0 {
                            break;
                        }
                    }
                }
                self.state = self.settled_state();
            }
            EngineState::Finished | EngineState::Seeding => {
                self.uploaded += upload_share;
            }
        }
    }

    fn install_metadata(&mut self, content: CatalogEntry) {
        let pending = self.pending_priorities.take().unwrap_or_default();
        self.files = Some(
            content
                .files
                .into_iter()
                .enumerate()
                .map(|(index, (path, size))| SimulatedFile {
                    path,
                    size,
                    done: 0,
                    priority: pending.get(index).copied().unwrap_or_default(),
                })
                .collect(),
        );
        self.name = Some(content.name);
        if self.descriptor.is_none() {
            self.descriptor = content.descriptor;
        }
    }

    fn settled_state(&self) -> EngineState {
        let Some(files) = self.files.as_ref() else {
            return EngineState::DownloadingMetadata;
        };
        let (wanted, wanted_done) = wanted_totals(files);
        if wanted_done < wanted {
            EngineState::Downloading
        } else if files.iter().all(|file| file.done >= file.size) {
            EngineState::Seeding
        } else {
            EngineState::Finished
        }
    }

    fn status(
        &self,
        config: &SimulationConfig,
        (download_share, upload_share): (u64, u64),
    ) -> EngineStatus {
        let (total_wanted, total_wanted_done) =
            self.files.as_deref().map(wanted_totals).unwrap_or((0, 0));
        let running = self.is_running();
        let downloading = running && self.state == EngineState::Downloading;
        let uploading = running && self.is_seed();
        let peers = if downloading || uploading || (running && self.state == EngineState::DownloadingMetadata) {
            config.max_simulated_peers
        } else {
            0
        };

        EngineStatus {
            state: self.state,
            paused: self.paused,
            auto_managed: self.auto_managed,
            has_metadata: self.files.is_some(),
            progress: if total_wanted > 0 {
                total_wanted_done as f32 / total_wanted as f32
            } else {
                0.0
            },
            download_rate: if downloading { download_share } else { 0 },
            upload_rate: if uploading { upload_share } else { 0 },
            peers,
            seeds: peers / 2,
            total_wanted,
            total_wanted_done,
            total_uploaded: self.uploaded,
            name: self.name.clone(),
            error: self.error.clone(),
        }
    }
}

fn wanted_totals(files: &[SimulatedFile]) -> (u64, u64) {
    files
        .iter()
        .filter(|file| file.priority.is_wanted())
        .fold((0, 0), |(wanted, done), file| {
            (wanted + file.size, done + file.done)
        })
}

#[async_trait]
impl TransferEngine for SimulatedEngine {
    async fn add_transfer(&self, params: AddTransferParams) -> Result<InfoHash, EngineError> {
        let resume = params
            .resume_data
            .as_deref()
            .map(|blob| {
                serde_json::from_slice::<ResumeRecord>(blob).map_err(|e| {
                    EngineError::CorruptResumeData {
                        reason: e.to_string(),
                    }
                })
            })
            .transpose()?;

        let descriptor_metadata = params
            .descriptor
            .as_deref()
            .map(|bytes| {
                DescriptorParser::parse(bytes).map_err(|e| EngineError::Rejected {
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let info_hash = match (&params.info_hash, &resume, &descriptor_metadata) {
            (Some(info_hash), _, _) => *info_hash,
            (None, Some(resume), _) => resume.info_hash,
            (None, None, Some(metadata)) => metadata.info_hash,
            (None, None, None) => {
                let magnet = params.magnet_uri.as_deref().ok_or_else(|| EngineError::Rejected {
                    reason: "No magnet, descriptor or resume data supplied".to_string(),
                })?;
                MagnetParser::parse_magnet_link(magnet)
                    .map_err(|e| EngineError::Rejected {
                        reason: e.to_string(),
                    })?
                    .info_hash
            }
        };

        let mut swarm = self.swarm.lock();
        Self::ensure_running(&swarm)?;
        swarm.calls.push(EngineCall::Add(info_hash));
        if swarm.faults.reject_adds {
            return Err(EngineError::Rejected {
                reason: "simulated engine refused transfer".to_string(),
            });
        }
        if resume.is_some() && swarm.faults.reject_resume_data {
            return Err(EngineError::CorruptResumeData {
                reason: "simulated engine refused resume data".to_string(),
            });
        }

        if swarm.transfers.contains_key(&info_hash) {
            return Ok(info_hash);
        }

        let mut transfer = SimulatedTransfer {
            name: params.name.clone(),
            magnet_uri: params.magnet_uri.clone(),
            trackers: params.trackers.clone(),
            save_path: params.save_path.clone(),
            files: None,
            descriptor: params.descriptor.clone(),
            state: EngineState::DownloadingMetadata,
            paused: params.paused,
            auto_managed: params.auto_managed,
            countdown: self.config.metadata_delay_steps,
            uploaded: 0,
            error: None,
            pending_priorities: params.file_priorities.clone(),
            queue_position: swarm.next_queue_position,
        };
        swarm.next_queue_position += 1;

        if let Some(metadata) = descriptor_metadata {
            transfer.install_metadata(CatalogEntry {
                name: metadata.name.clone(),
                files: metadata
                    .files
                    .iter()
                    .map(|file| (file.relative_path(), file.length))
                    .collect(),
                descriptor: params.descriptor.clone(),
            });
            transfer.state = EngineState::CheckingFiles;
            transfer.countdown = self.config.checking_steps;
        }

        if let Some(resume) = resume {
            transfer.name = transfer.name.or(resume.name);
            transfer.magnet_uri = transfer.magnet_uri.or(resume.magnet_uri);
            transfer.uploaded = resume.uploaded;
            for tracker in resume.trackers {
                if !transfer.trackers.contains(&tracker) {
                    transfer.trackers.push(tracker);
                }
            }
            if let Some(files) = resume.files {
                transfer.files = Some(files);
                transfer.state = EngineState::CheckingResumeData;
                transfer.countdown = 1;
            }
        }

        for tracker in &transfer.trackers {
            if swarm.dht_nodes.len() >= MAX_DHT_NODES {
                break;
            }
            if let Ok(url) = url::Url::parse(tracker)
                && let Some(host) = url.host_str()
                && !swarm.dht_nodes.iter().any(|node| node == host)
            {
                swarm.dht_nodes.push(host.to_string());
            }
        }

        swarm.transfers.insert(info_hash, transfer);
        swarm.apply_queue();
        Ok(info_hash)
    }

    async fn remove_transfer(
        &self,
        info_hash: InfoHash,
        delete_files: bool,
    ) -> Result<(), EngineError> {
        let mut swarm = self.swarm.lock();
        Self::ensure_running(&swarm)?;
        swarm
            .transfers
            .remove(&info_hash)
            .ok_or(EngineError::UnknownTransfer { info_hash })?;
        swarm.calls.push(EngineCall::Remove {
            info_hash,
            delete_files,
        });
        Ok(())
    }

    async fn pause(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.with_transfer(info_hash, Some(EngineCall::Pause(info_hash)), |transfer| {
            transfer.paused = true;
            Ok(())
        })
    }

    async fn resume(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        self.with_transfer(info_hash, Some(EngineCall::Resume(info_hash)), |transfer| {
            transfer.paused = false;
            Ok(())
        })
    }

    async fn set_auto_managed(
        &self,
        info_hash: InfoHash,
        enabled: bool,
    ) -> Result<(), EngineError> {
        self.with_transfer(
            info_hash,
            Some(EngineCall::SetAutoManaged(info_hash, enabled)),
            |transfer| {
                transfer.auto_managed = enabled;
                Ok(())
            },
        )
    }

    async fn force_recheck(&self, info_hash: InfoHash) -> Result<(), EngineError> {
        let checking_steps = self.config.checking_steps;
        self.with_transfer(
            info_hash,
            Some(EngineCall::ForceRecheck(info_hash)),
            |transfer| {
                transfer.error = None;
                transfer.state = EngineState::CheckingFiles;
                transfer.countdown = checking_steps;
                Ok(())
            },
        )
    }

    async fn status(&self, info_hash: InfoHash) -> Result<EngineStatus, EngineError> {
        let swarm = self.swarm.lock();
        Self::ensure_running(&swarm)?;
        if swarm.faults.failing_status.contains(&info_hash) {
            return Err(EngineError::StatusUnavailable {
                info_hash,
                reason: "simulated status failure".to_string(),
            });
        }
        let shares = swarm.rate_shares(&self.config);
        swarm
            .transfers
            .get(&info_hash)
            .map(|transfer| transfer.status(&self.config, shares))
            .ok_or(EngineError::UnknownTransfer { info_hash })
    }

    async fn file_manifest(&self, info_hash: InfoHash) -> Result<Vec<FileRead>, EngineError> {
        let mut swarm = self.swarm.lock();
        Self::ensure_running(&swarm)?;
        let files = swarm
            .transfers
            .get(&info_hash)
            .ok_or(EngineError::UnknownTransfer { info_hash })?
            .files
            .clone()
            .ok_or(EngineError::MetadataUnavailable { info_hash })?;

        let fail_first = swarm.faults.first_file_failures > 0;
        if fail_first {
            swarm.faults.first_file_failures -= 1;
        }
        let unreadable = &swarm.faults.unreadable_files;

        Ok(files
            .into_iter()
            .enumerate()
            .map(|(index, file)| {
                if (index == 0 && fail_first) || unreadable.contains(&index) {
                    Err(EngineError::FileUnavailable {
                        index,
                        reason: "simulated read failure".to_string(),
                    })
                } else {
                    Ok(EngineFile {
                        index,
                        path: file.path,
                        size: file.size,
                        priority: file.priority,
                    })
                }
            })
            .collect())
    }

    async fn file_progress(&self, info_hash: InfoHash) -> Result<Vec<u64>, EngineError> {
        self.with_transfer(info_hash, None, |transfer| {
            transfer
                .files
                .as_ref()
                .map(|files| files.iter().map(|file| file.done).collect())
                .ok_or(EngineError::MetadataUnavailable { info_hash })
        })
    }

    async fn set_file_priority(
        &self,
        info_hash: InfoHash,
        index: usize,
        priority: EnginePriority,
    ) -> Result<(), EngineError> {
        self.with_transfer(
            info_hash,
            Some(EngineCall::SetFilePriority {
                info_hash,
                index,
                priority,
            }),
            |transfer| {
                let files = transfer
                    .files
                    .as_mut()
                    .ok_or(EngineError::MetadataUnavailable { info_hash })?;
                let file = files.get_mut(index).ok_or(EngineError::FileUnavailable {
                    index,
                    reason: "index out of range".to_string(),
                })?;
                file.priority = priority;
                if matches!(
                    transfer.state,
                    EngineState::Downloading | EngineState::Finished | EngineState::Seeding
                ) {
                    transfer.state = transfer.settled_state();
                }
                Ok(())
            },
        )
    }

    async fn save_resume_blob(&self, info_hash: InfoHash) -> Result<Bytes, EngineError> {
        let record = self.with_transfer(
            info_hash,
            Some(EngineCall::SaveResume(info_hash)),
            |transfer| {
                Ok(ResumeRecord {
                    info_hash,
                    name: transfer.name.clone(),
                    magnet_uri: transfer.magnet_uri.clone(),
                    trackers: transfer.trackers.clone(),
                    save_path: transfer.save_path.clone(),
                    files: transfer.files.clone(),
                    uploaded: transfer.uploaded,
                })
            },
        )?;

        serde_json::to_vec(&record)
            .map(Bytes::from)
            .map_err(|e| EngineError::CorruptResumeData {
                reason: e.to_string(),
            })
    }

    async fn params_from_resume_blob(&self, blob: &[u8]) -> Result<AddTransferParams, EngineError> {
        let record: ResumeRecord =
            serde_json::from_slice(blob).map_err(|e| EngineError::CorruptResumeData {
                reason: e.to_string(),
            })?;

        Ok(AddTransferParams {
            info_hash: Some(record.info_hash),
            name: record.name,
            magnet_uri: record.magnet_uri,
            trackers: record.trackers,
            save_path: record.save_path,
            resume_data: Some(Bytes::copy_from_slice(blob)),
            ..Default::default()
        })
    }

    async fn export_descriptor(&self, info_hash: InfoHash) -> Result<Option<Bytes>, EngineError> {
        self.with_transfer(info_hash, None, |transfer| Ok(transfer.descriptor.clone()))
    }

    async fn global_state(&self) -> Result<Bytes, EngineError> {
        let swarm = self.swarm.lock();
        Self::ensure_running(&swarm)?;
        let state = GlobalState {
            dht_nodes: swarm.dht_nodes.clone(),
        };
        serde_json::to_vec(&state)
            .map(Bytes::from)
            .map_err(|e| EngineError::CorruptResumeData {
                reason: e.to_string(),
            })
    }

    async fn restore_global_state(&self, state: &[u8]) -> Result<(), EngineError> {
        let state: GlobalState =
            serde_json::from_slice(state).map_err(|e| EngineError::CorruptResumeData {
                reason: e.to_string(),
            })?;
        let mut swarm = self.swarm.lock();
        Self::ensure_running(&swarm)?;
        for node in state.dht_nodes {
            if swarm.dht_nodes.len() < MAX_DHT_NODES && !swarm.dht_nodes.contains(&node) {
                swarm.dht_nodes.push(node);
            }
        }
        Ok(())
    }

    async fn apply_settings(&self, settings: EngineSettings) -> Result<(), EngineError> {
        let mut swarm = self.swarm.lock();
        Self::ensure_running(&swarm)?;
        swarm.settings = settings;
        swarm.apply_queue();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), EngineError> {
        let delay = self.swarm.lock().faults.shutdown_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut swarm = self.swarm.lock();
        if !swarm.shut_down {
            swarm.shut_down = true;
            swarm.calls.push(EngineCall::Shutdown);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=Sample";

    fn hash() -> InfoHash {
        "0123456789abcdef0123456789abcdef01234567".parse().unwrap()
    }

    fn engine() -> SimulatedEngine {
        SimulatedEngine::new(SimulationConfig::deterministic_testing())
    }

    fn magnet_params() -> AddTransferParams {
        AddTransferParams {
            magnet_uri: Some(MAGNET.to_string()),
            auto_managed: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_is_deduplicated_by_fingerprint() {
        let engine = engine();

        let first = engine.add_transfer(magnet_params()).await.unwrap();
        let second = engine.add_transfer(magnet_params()).await.unwrap();

        assert_eq!(first, hash());
        assert_eq!(first, second);
        assert_eq!(engine.transfer_count(), 1);
    }

    #[tokio::test]
    async fn test_metadata_arrives_from_catalog() {
        let engine = engine();
        engine.add_transfer(magnet_params()).await.unwrap();

        engine.advance();
        let status = engine.status(hash()).await.unwrap();
        assert_eq!(status.state, EngineState::DownloadingMetadata);
        assert!(!status.has_metadata);
        assert!(matches!(
            engine.file_manifest(hash()).await,
            Err(EngineError::MetadataUnavailable { .. })
        ));

        engine.publish(
            hash(),
            CatalogEntry::new("Sample", &[("a.bin", 2048), ("b.bin", 1024)]),
        );
        engine.advance();

        let status = engine.status(hash()).await.unwrap();
        assert!(status.has_metadata);
        assert_eq!(status.state, EngineState::Downloading);
        assert_eq!(status.total_wanted, 3072);
        assert_eq!(engine.file_manifest(hash()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_download_progresses_to_seeding() {
        let engine = engine();
        engine.publish(hash(), CatalogEntry::new("Sample", &[("a.bin", 2048)]));
        engine.add_transfer(magnet_params()).await.unwrap();

        engine.advance_by(4);

        let status = engine.status(hash()).await.unwrap();
        assert_eq!(status.state, EngineState::Seeding);
        assert_eq!(status.progress, 1.0);
        assert_eq!(engine.file_progress(hash()).await.unwrap(), vec![2048]);
    }

    #[tokio::test]
    async fn test_skipped_files_finish_without_seeding() {
        let engine = engine();
        engine.publish(
            hash(),
            CatalogEntry::new("Sample", &[("a.bin", 512), ("b.bin", 512)]),
        );
        engine.add_transfer(magnet_params()).await.unwrap();
        engine.advance();
        engine
            .set_file_priority(hash(), 1, EnginePriority::SKIP)
            .await
            .unwrap();

        engine.advance();

        let status = engine.status(hash()).await.unwrap();
        assert_eq!(status.state, EngineState::Finished);
        assert_eq!(status.total_wanted, 512);
    }

    #[tokio::test]
    async fn test_resume_blob_restores_progress() {
        let engine = engine();
        engine.publish(hash(), CatalogEntry::new("Sample", &[("a.bin", 4096)]));
        engine.add_transfer(magnet_params()).await.unwrap();
        engine.advance_by(2);
        let blob = engine.save_resume_blob(hash()).await.unwrap();

        let fresh = self::engine();
        let params = fresh.params_from_resume_blob(&blob).await.unwrap();
        assert_eq!(params.info_hash, Some(hash()));
        fresh.add_transfer(params).await.unwrap();

        assert_eq!(fresh.file_progress(hash()).await.unwrap(), vec![1024]);
        assert_eq!(
            fresh.status(hash()).await.unwrap().state,
            EngineState::CheckingResumeData
        );
    }

    #[tokio::test]
    async fn test_corrupt_resume_blob_is_reported() {
        let engine = engine();
        assert!(matches!(
            engine.params_from_resume_blob(b"not json").await,
            Err(EngineError::CorruptResumeData { .. })
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let engine = engine();
        engine.update_faults(|faults| faults.reject_adds = true);
        assert!(matches!(
            engine.add_transfer(magnet_params()).await,
            Err(EngineError::Rejected { .. })
        ));

        engine.set_faults(FaultPlan {
            first_file_failures: 1,
            unreadable_files: HashSet::from([2]),
            ..Default::default()
        });
        engine.publish(
            hash(),
            CatalogEntry::new("Sample", &[("a", 1), ("b", 1), ("c", 1)]),
        );
        engine.add_transfer(magnet_params()).await.unwrap();
        engine.advance();

        let first = engine.file_manifest(hash()).await.unwrap();
        assert!(first[0].is_err());
        let second = engine.file_manifest(hash()).await.unwrap();
        assert!(second[0].is_ok());
        assert!(second[1].is_ok());
        assert!(second[2].is_err());
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let engine = engine();
        engine.add_transfer(magnet_params()).await.unwrap();
        engine.shutdown().await.unwrap();

        assert!(matches!(
            engine.status(hash()).await,
            Err(EngineError::Shutdown)
        ));
        assert_eq!(engine.calls().last(), Some(&EngineCall::Shutdown));
    }

    #[tokio::test]
    async fn test_queue_pauses_transfers_beyond_active_limit() {
        let engine = engine();
        engine
            .apply_settings(EngineSettings {
                max_active_downloads: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = engine.add_transfer(magnet_params()).await.unwrap();
        let second = engine
            .add_transfer(AddTransferParams {
                magnet_uri: Some(
                    "magnet:?xt=urn:btih:89abcdef0123456789abcdef0123456789abcdef".to_string(),
                ),
                auto_managed: true,
                ..Default::default()
            })
            .await
            .unwrap();

        let queued = engine.status(second).await.unwrap();
        assert!(queued.paused);
        assert!(queued.auto_managed);
        assert!(!engine.status(first).await.unwrap().paused);

        // Taking the first out of the queue frees its slot.
        engine.set_auto_managed(first, false).await.unwrap();
        engine.pause(first).await.unwrap();
        engine.advance();
        assert!(!engine.status(second).await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_download_limit_is_shared() {
        let engine = engine();
        engine
            .apply_settings(EngineSettings {
                download_rate_limit: 256,
                ..Default::default()
            })
            .await
            .unwrap();
        engine.publish(hash(), CatalogEntry::new("Sample", &[("a.bin", 4096)]));
        engine.add_transfer(magnet_params()).await.unwrap();

        engine.advance_by(2);

        let status = engine.status(hash()).await.unwrap();
        assert_eq!(status.download_rate, 256);
        assert_eq!(status.total_wanted_done, 256);
    }

    #[tokio::test]
    async fn test_rejected_add_is_logged() {
        let engine = engine();
        engine.update_faults(|faults| faults.reject_adds = true);

        assert!(engine.add_transfer(magnet_params()).await.is_err());
        assert_eq!(engine.calls(), vec![EngineCall::Add(hash())]);
        assert!(!engine.contains(hash()));
    }

    #[tokio::test]
    async fn test_global_state_round_trip() {
        let engine = engine();
        let params = AddTransferParams {
            trackers: vec!["udp://tracker.example.org:1337/announce".to_string()],
            ..magnet_params()
        };
        engine.add_transfer(params).await.unwrap();
        let state = engine.global_state().await.unwrap();

        let fresh = self::engine();
        fresh.restore_global_state(&state).await.unwrap();
        assert_eq!(fresh.dht_nodes(), vec!["tracker.example.org"]);
    }
}
