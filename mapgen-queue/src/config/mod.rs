//! Service configuration.
//!
//! Values come from defaults, overridden by `MAPGEN_*` environment
//! variables (a `.env` file is loaded first when present).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

use crate::queue::{JobQueueConfig, QueueOrdering};
use crate::session::{DEFAULT_HISTORY_CAPACITY, SessionId};
use crate::storage::StorageConfig;
use crate::worker::WorkerPoolConfig;

/// Directories the service reads from and writes into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root of per-session working directories and include-all archives.
    pub data_root: PathBuf,
    /// Where inline OSM data is saved.
    pub custom_osm_dir: PathBuf,
    /// Pre-uploaded OSM files users may reference by name.
    pub osm_defaults_dir: PathBuf,
    /// Pre-uploaded DEM files users may reference by name.
    pub dem_defaults_dir: PathBuf,
    /// Per-game schema and map template directories.
    pub templates_dir: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self::under(Path::new("data"))
    }
}

impl DataPaths {
    /// Lay every directory out under one root.
    pub fn under(root: &Path) -> Self {
        Self {
            data_root: root.join("tasks"),
            custom_osm_dir: root.join("custom_osm"),
            osm_defaults_dir: root.join("defaults").join("osm"),
            dem_defaults_dir: root.join("defaults").join("dem"),
            templates_dir: root.join("templates"),
        }
    }

    /// Working directory of a session: `<data_root>/<id>`.
    pub fn working_dir(&self, session: &SessionId) -> PathBuf {
        self.data_root.join(session.as_str())
    }

    /// Include-all package of a session: `<data_root>/<id>.zip`.
    ///
    /// Identities contain dots, so the name is built whole rather than by
    /// swapping an extension.
    pub fn archive_path(&self, session: &SessionId) -> PathBuf {
        self.data_root.join(format!("{}.zip", session.as_str()))
    }

    /// Where inline OSM data for a session is saved.
    pub fn custom_osm_file(&self, session: &SessionId) -> PathBuf {
        self.custom_osm_dir
            .join(format!("{}_custom.osm", session.as_str()))
    }

    /// Directory holding one kind of custom schema for a game.
    pub fn schema_dir(&self, game: &str, kind: &str) -> PathBuf {
        self.templates_dir
            .join(game)
            .join(format!("{}_schemas", kind))
    }

    /// Directory holding map templates for a game.
    pub fn map_template_dir(&self, game: &str) -> PathBuf {
        self.templates_dir.join(game).join("map_templates")
    }
}

fn default_public_max_map_size() -> u32 {
    4096
}

fn default_public_queue_limit() -> usize {
    5
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// Top-level configuration of the queue service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub paths: DataPaths,

    /// Public deployments cap map sizes and queue depth.
    #[serde(default)]
    pub public_mode: bool,

    /// Largest size and output size a public job may request.
    #[serde(default = "default_public_max_map_size")]
    pub public_max_map_size: u32,

    /// Public admission is refused once this many jobs are waiting.
    #[serde(default = "default_public_queue_limit")]
    pub public_queue_limit: usize,

    /// Optional cap on queued plus processing sessions.
    #[serde(default)]
    pub max_active_sessions: Option<usize>,

    /// Number of retained history entries.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub queue: JobQueueConfig,

    #[serde(default)]
    pub workers: WorkerPoolConfig,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            paths: DataPaths::default(),
            public_mode: false,
            public_max_map_size: default_public_max_map_size(),
            public_queue_limit: default_public_queue_limit(),
            max_active_sessions: None,
            history_capacity: default_history_capacity(),
            storage: StorageConfig::default(),
            queue: JobQueueConfig::default(),
            workers: WorkerPoolConfig::default(),
            log_dir: default_log_dir(),
        }
    }
}

impl ServiceConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paths(mut self, paths: DataPaths) -> Self {
        self.paths = paths;
        self
    }

    pub fn with_public_mode(mut self, public_mode: bool) -> Self {
        self.public_mode = public_mode;
        self
    }

    pub fn with_public_max_map_size(mut self, size: u32) -> Self {
        self.public_max_map_size = size;
        self
    }

    pub fn with_public_queue_limit(mut self, limit: usize) -> Self {
        self.public_queue_limit = limit;
        self
    }

    pub fn with_max_active_sessions(mut self, limit: usize) -> Self {
        self.max_active_sessions = Some(limit);
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_queue_ordering(mut self, ordering: QueueOrdering) -> Self {
        self.queue.ordering = ordering;
        self
    }

    pub fn with_workers(mut self, max_workers: usize) -> Self {
        self.workers.max_workers = max_workers;
        self
    }

    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = log_dir.into();
        self
    }

    /// Load config from the environment, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `MAPGEN_DATA_DIR`, `MAPGEN_CUSTOM_OSM_DIR`, `MAPGEN_OSM_DEFAULTS_DIR`,
    ///   `MAPGEN_DEM_DEFAULTS_DIR`, `MAPGEN_TEMPLATES_DIR`, `MAPGEN_LOG_DIR`
    /// - `MAPGEN_PUBLIC` (true/false)
    /// - `MAPGEN_PUBLIC_MAX_MAP_SIZE`, `MAPGEN_PUBLIC_QUEUE_LIMIT`,
    ///   `MAPGEN_MAX_ACTIVE_SESSIONS`
    /// - `MAPGEN_STORAGE_TTL_SECS`, `MAPGEN_STORAGE_MAX_SIZE`,
    ///   `MAPGEN_CACHE_SWEEP_INTERVAL_SECS`
    /// - `MAPGEN_HISTORY_CAPACITY`, `MAPGEN_WORKERS`,
    ///   `MAPGEN_QUEUE_ORDERING` (fifo / size_priority)
    pub fn from_env_or_default() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = var("MAPGEN_DATA_DIR") {
            config.paths.data_root = PathBuf::from(dir);
        }
        if let Some(dir) = var("MAPGEN_CUSTOM_OSM_DIR") {
            config.paths.custom_osm_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("MAPGEN_OSM_DEFAULTS_DIR") {
            config.paths.osm_defaults_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("MAPGEN_DEM_DEFAULTS_DIR") {
            config.paths.dem_defaults_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("MAPGEN_TEMPLATES_DIR") {
            config.paths.templates_dir = PathBuf::from(dir);
        }
        if let Some(dir) = var("MAPGEN_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        if let Some(public) = parse(&var, "MAPGEN_PUBLIC") {
            config.public_mode = public;
        }
        if let Some(size) = parse(&var, "MAPGEN_PUBLIC_MAX_MAP_SIZE") {
            config.public_max_map_size = size;
        }
        if let Some(limit) = parse(&var, "MAPGEN_PUBLIC_QUEUE_LIMIT") {
            config.public_queue_limit = limit;
        }
        if let Some(limit) = parse(&var, "MAPGEN_MAX_ACTIVE_SESSIONS") {
            config.max_active_sessions = Some(limit);
        }
        if let Some(ttl) = parse(&var, "MAPGEN_STORAGE_TTL_SECS") {
            config.storage.ttl_secs = ttl;
        }
        if let Some(max) = parse(&var, "MAPGEN_STORAGE_MAX_SIZE") {
            config.storage.max_size = max;
        }
        if let Some(secs) = parse(&var, "MAPGEN_CACHE_SWEEP_INTERVAL_SECS") {
            config.storage.sweep_interval_secs = secs;
        }
        if let Some(capacity) = parse(&var, "MAPGEN_HISTORY_CAPACITY") {
            config.history_capacity = capacity;
        }
        let workers: Option<usize> = parse(&var, "MAPGEN_WORKERS");
        if let Some(workers) = workers {
            config.workers.max_workers = workers.max(1);
        }
        if let Some(ordering) = parse(&var, "MAPGEN_QUEUE_ORDERING") {
            config.queue.ordering = ordering;
        }

        config
    }
}

fn parse<T, F>(var: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable configuration value");
            None
        }
    }
}
