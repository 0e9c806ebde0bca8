//! Core storage and coordination primitives for a Kafka-wire-compatible
//! streaming broker: segmented partition logs, topic/partition
//! management, consumer-group coordination, ACL authorization, and a
//! schema registry. The wire protocol codec and network server are
//! out of scope for this crate.
//!
//! Grounded on `rust-core/src/lib.rs`'s facade-over-subsystems shape:
//! one top-level type ([`Broker`]) that owns every subsystem and
//! wires config, metrics, and background tasks together at startup.

pub mod acl;
pub mod cleaner;
pub mod config;
pub mod error;
pub mod group;
pub mod log;
pub mod lru;
pub mod manager;
pub mod memory;
pub mod metrics;
pub mod persistence;
pub mod schema;
pub mod snapshot;
pub mod tiered;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub use error::{Error, Result};

use acl::AclAuthorizer;
use cleaner::BackgroundCleaner;
use config::BrokerConfig;
use group::GroupCoordinator;
use manager::TopicManager;
use metrics::BrokerMetrics;
use schema::SchemaRegistry;
use snapshot::SnapshotManager;

struct ChronoTimer;

impl tracing_subscriber::fmt::time::FormatTime for ChronoTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Utc::now().to_rfc3339())
    }
}

/// Installs a `tracing` subscriber writing RFC 3339 timestamps (via
/// `chrono`, not the default monotonic clock) and honoring
/// `RUST_LOG`. Call once at process startup.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_timer(ChronoTimer)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Owns every broker subsystem for one node. Construct with
/// [`Broker::open`], which recovers any state already on disk.
pub struct Broker {
    pub config: BrokerConfig,
    pub metrics: Arc<BrokerMetrics>,
    pub topics: Arc<TopicManager>,
    pub groups: Arc<GroupCoordinator>,
    pub acl: Arc<AclAuthorizer>,
    pub schemas: Arc<SchemaRegistry>,
    pub snapshots: Arc<SnapshotManager>,
    cleaner: Option<BackgroundCleaner>,
}

impl Broker {
    /// Opens (or creates) a broker rooted at `config.data_dir`,
    /// recovering topics, ACLs, schemas, and snapshot history from
    /// disk, but does not start background tasks — call
    /// [`Broker::spawn_background_tasks`] for that.
    pub fn open(config: BrokerConfig, node_id: u64) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let metrics = Arc::new(BrokerMetrics::new());

        let topics = Arc::new(TopicManager::open(
            config.data_dir.join("topics"),
            config.log.clone(),
            node_id,
            metrics.clone(),
        )?);
        let groups = Arc::new(
            GroupCoordinator::open(config.data_dir.join("groups.json"), config.group.clone())?
                .with_metrics(metrics.clone()),
        );
        let acl = Arc::new(AclAuthorizer::open(
            config.data_dir.join("acls.json"),
            config.acl.acl_cache_size,
            if config.acl.acl_cache_ttl_ms == 0 {
                None
            } else {
                Some(Duration::from_millis(config.acl.acl_cache_ttl_ms))
            },
            metrics.clone(),
        )?);
        let schemas = Arc::new(SchemaRegistry::open(
            config.data_dir.join("schemas.json"),
            config.schema.compatibility_default,
            config.schema.schema_cache_size,
            metrics.clone(),
        )?);
        let snapshots = Arc::new(SnapshotManager::open(
            config.data_dir.join("snapshots"),
            config.snapshot.clone(),
        )?);

        info!(data_dir = %config.data_dir.display(), "broker opened");
        Ok(Self {
            config,
            metrics,
            topics,
            groups,
            acl,
            schemas,
            snapshots,
            cleaner: None,
        })
    }

    /// Starts the periodic retention/compaction sweep. Idempotent
    /// only in the sense that calling it twice spawns two tasks —
    /// callers should call this once, typically right after `open`.
    pub fn spawn_background_tasks(&mut self) {
        let cleaner = BackgroundCleaner::spawn(
            self.topics.clone(),
            self.metrics.clone(),
            Duration::from_millis(self.config.log.flush_interval_ms.max(1_000)),
            self.config.log.delete_retention_ms,
        );
        self.cleaner = Some(cleaner);
    }

    pub async fn shutdown(mut self) {
        if let Some(cleaner) = self.cleaner.take() {
            cleaner.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_expected_layout() {
        let dir = tempdir().unwrap();
        let mut config = BrokerConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let broker = Broker::open(config, 1).unwrap();
        broker.topics.create_topic(crate::types::TopicConfig::new("t", 1, 1)).unwrap();
        assert_eq!(broker.topics.list_topics(), vec!["t".to_string()]);
        assert!(dir.path().join("topics").exists());
    }
}
