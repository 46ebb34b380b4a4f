//! Configuration management for Tessera services.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`TESSERA__` prefix, `__` separator)
//! 2. Config file (`tessera.toml` or any prefix given on the command line)
//! 3. Defaults

use serde::Deserialize;

use crate::error::CoreError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub merge: MergeConfig,

    #[serde(default)]
    pub tombstones: TombstoneConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub neo4j: Neo4jSettings,

    /// Optional schema definition file replacing the built-in schema.
    #[serde(default)]
    pub schema_path: Option<String>,
}

/// Participant lock settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Maximum time to wait for a lock before failing with a lock timeout.
    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,

    /// Lease duration of an acquired lock.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,
}

/// Merge redirection batching.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    /// Connection updates per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Batches in flight at once.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

/// Recently-deleted guard.
#[derive(Debug, Clone, Deserialize)]
pub struct TombstoneConfig {
    #[serde(default = "default_tombstone_ttl")]
    pub ttl_secs: u64,
}

/// Event journal location.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_journal_dir")]
    pub journal_dir: String,
}

/// Neo4j connection settings for the graph-backed index.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jSettings {
    #[serde(default = "default_neo4j_uri")]
    pub uri: String,

    #[serde(default = "default_neo4j_user")]
    pub user: String,

    #[serde(default = "default_neo4j_password")]
    pub password: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    250
}

fn default_max_concurrent_batches() -> usize {
    4
}

fn default_tombstone_ttl() -> u64 {
    120
}

fn default_journal_dir() -> String {
    "./journal".to_string()
}

fn default_neo4j_uri() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_neo4j_user() -> String {
    "neo4j".to_string()
}

fn default_neo4j_password() -> String {
    "tessera-dev".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_fetch_size() -> usize {
    256
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout_ms(),
            ttl_ms: default_lock_ttl_ms(),
        }
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
        }
    }
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_tombstone_ttl(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            journal_dir: default_journal_dir(),
        }
    }
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            uri: default_neo4j_uri(),
            user: default_neo4j_user(),
            password: default_neo4j_password(),
            max_connections: default_max_connections(),
            fetch_size: default_fetch_size(),
        }
    }
}

impl EngineConfig {
    /// Load from `{file_prefix}.toml` (optional) and `TESSERA__*` variables.
    pub fn load(file_prefix: &str) -> Result<Self, CoreError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("TESSERA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = cfg.try_deserialize()?;
        if config.merge.batch_size == 0 || config.merge.max_concurrent_batches == 0 {
            return Err(CoreError::InvalidConfig(
                "merge.batch_size and merge.max_concurrent_batches must be positive".into(),
            ));
        }
        Ok(config)
    }
}
