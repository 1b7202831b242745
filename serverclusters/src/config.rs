use crate::affinity::DEFAULT_CAPACITY;

use async_trait::async_trait;
use dotenvy::dotenv;
use serde::Deserialize;
use serverclusters_db::{Backend, StorageError, ValueStorage, open_storage};
use std::env::var;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Cluster definitions file
    /// Env: CLUSTERS_PATH (default: "clusters.toml")
    pub clusters_path: PathBuf,

    /// Persistence engine for logout affinity
    /// Env: STORAGE_BACKEND (default: sqlite; "file" for json files)
    pub storage_backend: Backend,

    /// SQLite database file, or the directory for json files
    /// Env: STORAGE_PATH (default: "serverclusters.db")
    pub storage_path: PathBuf,

    /// Cached logout servers per cluster
    /// Env: AFFINITY_CACHE_SIZE (default: 1000)
    pub affinity_cache_size: usize,

    /// Cooldown between warp/spawn uses, zero or negative disables it
    /// Env: TELEPORT_DELAY_SECS (default: 0)
    pub teleport_delay: Duration,

    /// How long a teleport request can be accepted
    /// Env: REQUEST_TIMEOUT_SECS (default: 120)
    pub request_timeout: Duration,

    /// How long to wait for a backend to report a player location
    /// Env: LOCATION_TIMEOUT_SECS (default: 5)
    pub location_timeout: Duration,

    /// Debug logging
    /// Env: DEBUG (default: false)
    pub debug: bool,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv();
        let defaults = Self::default();
        Self {
            clusters_path: PathBuf::from(env_or_default_string("CLUSTERS_PATH", "clusters.toml")),
            storage_backend: env_or_default("STORAGE_BACKEND", defaults.storage_backend),
            storage_path: PathBuf::from(env_or_default_string(
                "STORAGE_PATH",
                "serverclusters.db",
            )),
            affinity_cache_size: env_or_default("AFFINITY_CACHE_SIZE", defaults.affinity_cache_size),
            teleport_delay: secs_or_zero(env_or_default("TELEPORT_DELAY_SECS", 0)),
            request_timeout: secs_or_zero(env_or_default("REQUEST_TIMEOUT_SECS", 120)),
            location_timeout: secs_or_zero(env_or_default("LOCATION_TIMEOUT_SECS", 5)),
            debug: env_or_default("DEBUG", false),
        }
    }

    pub fn storage_settings(&self) -> StorageSettings {
        StorageSettings {
            backend: self.storage_backend,
            location: self.storage_path.clone(),
            cache_capacity: self.affinity_cache_size,
        }
    }

    pub fn teleport_settings(&self) -> TeleportSettings {
        TeleportSettings {
            teleport_delay: self.teleport_delay,
            request_timeout: self.request_timeout,
            location_timeout: self.location_timeout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clusters_path: PathBuf::from("clusters.toml"),
            storage_backend: Backend::Sqlite,
            storage_path: PathBuf::from("serverclusters.db"),
            affinity_cache_size: DEFAULT_CAPACITY,
            teleport_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(120),
            location_timeout: Duration::from_secs(5),
            debug: false,
        }
    }
}

/// Timing knobs of the teleport coordinator.
#[derive(Debug, Clone)]
pub struct TeleportSettings {
    pub teleport_delay: Duration,
    pub request_timeout: Duration,
    pub location_timeout: Duration,
}

impl Default for TeleportSettings {
    fn default() -> Self {
        Config::default().teleport_settings()
    }
}

/// Opens the durable store behind a cluster's affinity cache.
#[async_trait]
pub trait AffinityStoreOpener: Send + Sync {
    async fn open_store(&self, name: &str) -> Result<Arc<dyn ValueStorage>, StorageError>;

    fn cache_capacity(&self) -> usize {
        DEFAULT_CAPACITY
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub backend: Backend,
    pub location: PathBuf,
    pub cache_capacity: usize,
}

#[async_trait]
impl AffinityStoreOpener for StorageSettings {
    async fn open_store(&self, name: &str) -> Result<Arc<dyn ValueStorage>, StorageError> {
        open_storage(self.backend, &self.location, name).await
    }

    fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }
}

/// One `[[cluster]]` table of the definitions file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterDefinition {
    pub name: String,
    pub servers: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub ignore_logout_server: bool,
}

impl ClusterDefinition {
    pub fn new(name: impl Into<String>, servers: &[&str]) -> Self {
        Self {
            name: name.into(),
            servers: servers.iter().map(|s| s.to_string()).collect(),
            aliases: Vec::new(),
            default: None,
            hidden: false,
            ignore_logout_server: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DefinitionsFile {
    #[serde(default, rename = "cluster")]
    clusters: Vec<ClusterDefinition>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not parse cluster definitions: {0}")]
    Parse(#[from] toml::de::Error),
}

pub fn parse_cluster_definitions(content: &str) -> Result<Vec<ClusterDefinition>, ConfigError> {
    let file: DefinitionsFile = toml::from_str(content)?;
    Ok(file.clusters)
}

pub async fn load_cluster_definitions(
    path: impl AsRef<Path>,
) -> Result<Vec<ClusterDefinition>, ConfigError> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_cluster_definitions(&content)
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}

/// Longest accepted delay or timeout, one year.
const MAX_SECS: i64 = 365 * 24 * 60 * 60;

fn secs_or_zero(secs: i64) -> Duration {
    Duration::from_secs(secs.clamp(0, MAX_SECS) as u64)
}
