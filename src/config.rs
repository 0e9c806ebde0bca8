//! Recognized broker configuration.
//!
//! One nested `*Config` struct per component, each with a `Default`
//! giving production-sane numbers, grounded on `rust-core/src/config.rs`'s
//! nested-config layout and `lumadb-common::Config::load`'s file-backed
//! loader.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub acl: AclConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub tiered: TieredStorageConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./broker_data"),
            log: LogConfig::default(),
            replication: ReplicationConfig::default(),
            group: GroupConfig::default(),
            acl: AclConfig::default(),
            schema: SchemaConfig::default(),
            snapshot: SnapshotConfig::default(),
            tiered: TieredStorageConfig::default(),
        }
    }
}

impl BrokerConfig {
    /// Loads configuration from a JSON file. Synchronous: config is
    /// loaded once at startup, well before the async runtime needs it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_json::from_str(&content)
            .map_err(|e| Error::InvalidInput(format!("failed to parse config: {e}")))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub segment_size_limit: u64,
    pub segment_ms: u64,
    pub index_interval_bytes: u32,
    pub retention_bytes: Option<u64>,
    pub retention_ms: Option<u64>,
    pub flush_bytes: u64,
    pub flush_messages: u64,
    pub flush_interval_ms: u64,
    pub compaction_enabled: bool,
    pub min_cleanable_ratio: f64,
    pub delete_retention_ms: u64,
    pub max_record_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            segment_size_limit: 1024 * 1024 * 1024,
            segment_ms: 7 * 24 * 60 * 60 * 1000,
            index_interval_bytes: 4096,
            retention_bytes: None,
            retention_ms: Some(7 * 24 * 60 * 60 * 1000),
            flush_bytes: 1024 * 1024,
            flush_messages: 10_000,
            flush_interval_ms: 1_000,
            compaction_enabled: false,
            min_cleanable_ratio: 0.5,
            delete_retention_ms: 24 * 60 * 60 * 1000,
            max_record_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub replica_lag_time_max_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_lag_time_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub session_timeout_min_ms: u64,
    pub session_timeout_max_ms: u64,
    pub rebalance_timeout_default_ms: u64,
    pub offset_retention_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            session_timeout_min_ms: 6_000,
            session_timeout_max_ms: 300_000,
            rebalance_timeout_default_ms: 60_000,
            offset_retention_ms: 7 * 24 * 60 * 60 * 1000,
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclConfig {
    pub acl_enabled: bool,
    pub acl_cache_size: usize,
    pub acl_cache_ttl_ms: u64,
}

impl Default for AclConfig {
    fn default() -> Self {
        Self {
            acl_enabled: true,
            acl_cache_size: 10_000,
            acl_cache_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub compatibility_default: crate::types::CompatibilityMode,
    pub schema_cache_size: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            compatibility_default: crate::types::CompatibilityMode::Backward,
            schema_cache_size: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    pub snapshot_max_count: usize,
    pub snapshot_retention_ms: u64,
    pub snapshot_min_interval_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_max_count: 5,
            snapshot_retention_ms: 7 * 24 * 60 * 60 * 1000,
            snapshot_min_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredStorageConfig {
    pub tiered_warm_threshold_ms: u64,
    pub tiered_cold_threshold_ms: u64,
}

impl Default for TieredStorageConfig {
    fn default() -> Self {
        Self {
            tiered_warm_threshold_ms: 60 * 60 * 1000,
            tiered_cold_threshold_ms: 24 * 60 * 60 * 1000,
        }
    }
}
