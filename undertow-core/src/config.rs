//! Centralized configuration for Undertow.
//!
//! All cadences, timeouts and directories used by the session manager are
//! defined here instead of being scattered through the codebase.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineSettings;

/// Public trackers appended to magnet sources so peers can be found even
/// when the link carries none.
pub const DEFAULT_FALLBACK_TRACKERS: &[&str] = &[
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.stealth.si:80/announce",
    "udp://tracker.torrent.eu.org:451/announce",
    "udp://exodus.desync.com:6969/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
];

/// Central configuration for all Undertow components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    pub simulation: SimulationConfig,
}

/// Session manager cadences and bounded waits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Reconciliation tick interval
    pub reconcile_interval: Duration,
    /// Interval between durable persistence flushes
    pub flush_interval: Duration,
    /// Default bound for `wait_for_metadata`
    pub metadata_timeout: Duration,
    /// Poll interval while waiting for metadata
    pub metadata_poll_interval: Duration,
    /// Upper bound on the shutdown flush and engine release
    pub shutdown_grace: Duration,
    /// Upper bound on one per-transfer engine call made during a flush
    pub engine_call_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(1),
            flush_interval: Duration::from_secs(60),
            metadata_timeout: Duration::from_secs(180),
            metadata_poll_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(5),
            engine_call_timeout: Duration::from_secs(2),
        }
    }
}

/// On-disk locations.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding the manifest, resume blobs and engine state
    pub state_dir: PathBuf,
    /// Save path for transfers added without an explicit one
    pub download_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            state_dir: base.join(".undertow"),
            download_dir: base.join("Downloads"),
        }
    }
}

/// Parameters passed to the engine when registering transfers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Trackers appended to magnet sources, never duplicated
    pub fallback_trackers: Vec<String>,
    /// Per-transfer peer connection limit (None = engine default)
    pub max_connections_per_transfer: Option<u32>,
    /// Session-wide download limit in bytes per second (0 = unlimited)
    pub download_rate_limit: u64,
    /// Session-wide upload limit in bytes per second (0 = unlimited)
    pub upload_rate_limit: u64,
    /// Queued transfers allowed to download at once (None = unlimited)
    pub max_active_downloads: Option<usize>,
    /// Queued transfers allowed to seed at once (None = unlimited)
    pub max_active_seeds: Option<usize>,
}

impl EngineConfig {
    /// Session-wide settings handed to the engine when the session opens.
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            download_rate_limit: self.download_rate_limit,
            upload_rate_limit: self.upload_rate_limit,
            max_active_downloads: self.max_active_downloads,
            max_active_seeds: self.max_active_seeds,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fallback_trackers: DEFAULT_FALLBACK_TRACKERS
                .iter()
                .map(|tracker| tracker.to_string())
                .collect(),
            max_connections_per_transfer: Some(200),
            download_rate_limit: 0,
            upload_rate_limit: 0,
            max_active_downloads: Some(5),
            max_active_seeds: Some(5),
        }
    }
}

/// Simulated engine configuration for testing and development.
///
/// The simulated engine advances in discrete steps; all delays are counted
/// in steps rather than wall-clock time so tests stay deterministic.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Deterministic seed used to derive synthesized content
    pub deterministic_seed: Option<u64>,
    /// Wall-clock duration of one step when the clock task runs
    pub step_interval: Duration,
    /// Steps before metadata arrives for a magnet transfer
    pub metadata_delay_steps: u32,
    /// Steps spent verifying data after add or force-recheck
    pub checking_steps: u32,
    /// Simulated download speed in bytes per second
    pub simulated_download_speed: u64,
    /// Simulated upload speed in bytes per second
    pub simulated_upload_speed: u64,
    /// Maximum simulated peers per transfer
    pub max_simulated_peers: u32,
    /// Invent metadata for magnets missing from the catalog
    pub synthesize_metadata: bool,
    /// Total size of synthesized content
    pub synthesized_size: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            step_interval: Duration::from_secs(1),
            metadata_delay_steps: 3,
            checking_steps: 2,
            simulated_download_speed: 1_048_576, // 1 MiB/s
            simulated_upload_speed: 262_144,
            max_simulated_peers: 20,
            synthesize_metadata: true,
            synthesized_size: 64 * 1_048_576,
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration for deterministic testing.
    ///
    /// Nothing is synthesized: tests publish content explicitly so metadata
    /// only arrives when they say so.
    pub fn deterministic_testing() -> Self {
        Self {
            deterministic_seed: Some(42),
            step_interval: Duration::from_millis(10),
            metadata_delay_steps: 1,
            checking_steps: 1,
            simulated_download_speed: 1_024,
            simulated_upload_speed: 256,
            max_simulated_peers: 10,
            synthesize_metadata: false,
            synthesized_size: 4_096,
        }
    }

    /// Creates a configuration for the interactive demo.
    pub fn realistic_simulation() -> Self {
        Self {
            deterministic_seed: None,
            step_interval: Duration::from_secs(1),
            metadata_delay_steps: 4,
            checking_steps: 3,
            simulated_download_speed: 2_097_152, // 2 MiB/s
            simulated_upload_speed: 524_288,
            max_simulated_peers: 50,
            synthesize_metadata: true,
            synthesized_size: 256 * 1_048_576,
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = std::env::var_os("UNDERTOW_STATE_DIR") {
            config.storage.state_dir = PathBuf::from(dir);
        }

        if let Some(dir) = std::env::var_os("UNDERTOW_DOWNLOAD_DIR") {
            config.storage.download_dir = PathBuf::from(dir);
        }

        if let Some(millis) = env_u64("UNDERTOW_RECONCILE_INTERVAL_MS")
            && millis > 0
        {
            config.session.reconcile_interval = Duration::from_millis(millis);
        }

        if let Some(seconds) = env_u64("UNDERTOW_FLUSH_INTERVAL_SECS")
            && seconds > 0
        {
            config.session.flush_interval = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_u64("UNDERTOW_METADATA_TIMEOUT_SECS") {
            config.session.metadata_timeout = Duration::from_secs(seconds);
        }

        if let Some(limit) = env_u64("UNDERTOW_DOWNLOAD_LIMIT") {
            config.engine.download_rate_limit = limit;
        }

        if let Some(limit) = env_u64("UNDERTOW_UPLOAD_LIMIT") {
            config.engine.upload_rate_limit = limit;
        }

        if let Some(count) = env_u64("UNDERTOW_MAX_ACTIVE_DOWNLOADS") {
            config.engine.max_active_downloads = (count > 0).then_some(count as usize);
        }

        if let Some(count) = env_u64("UNDERTOW_MAX_ACTIVE_SEEDS") {
            config.engine.max_active_seeds = (count > 0).then_some(count as usize);
        }

        if let Some(seed) = env_u64("UNDERTOW_SIMULATION_SEED") {
            config.simulation.deterministic_seed = Some(seed);
        }

        config
    }

    /// Creates a configuration optimized for testing, rooted at `dir`.
    ///
    /// Cadences are in milliseconds and no fallback trackers are added so
    /// tests can assert on exact engine parameters.
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            session: SessionConfig {
                reconcile_interval: Duration::from_millis(20),
                flush_interval: Duration::from_millis(200),
                metadata_timeout: Duration::from_millis(500),
                metadata_poll_interval: Duration::from_millis(10),
                shutdown_grace: Duration::from_millis(500),
                engine_call_timeout: Duration::from_millis(100),
            },
            storage: StorageConfig {
                state_dir: dir.join("state"),
                download_dir: dir.join("downloads"),
            },
            engine: EngineConfig {
                fallback_trackers: Vec::new(),
                max_connections_per_transfer: None,
                download_rate_limit: 0,
                upload_rate_limit: 0,
                max_active_downloads: None,
                max_active_seeds: None,
            },
            simulation: SimulationConfig::deterministic_testing(),
        }
    }

    /// Creates a configuration for the interactive demo.
    pub fn for_development() -> Self {
        Self {
            simulation: SimulationConfig::realistic_simulation(),
            ..Self::from_env()
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}
