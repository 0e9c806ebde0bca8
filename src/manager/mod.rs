//! Topic/partition manager.
//!
//! Grounded on `crates/lumadb-streaming/src/engine.rs`'s
//! `StreamingEngine` (`DashMap<String, Topic>` registry, create/list)
//! generalized from a single in-memory map to one that also owns each
//! partition's on-disk [`PartitionLog`], and on
//! `crates/lumadb-common/src/types.rs`'s `TopicMetadata`/
//! `PartitionMetadata` shape for the describe/list surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::log::PartitionLog;
use crate::metrics::BrokerMetrics;
use crate::types::{PartitionId, PartitionMetadata, PartitionState, TopicConfig, TopicMetadata};

struct Topic {
    config: TopicConfig,
    partitions: Vec<Arc<PartitionLog>>,
    states: RwLock<Vec<PartitionState>>,
}

/// Owns every topic's partition logs and replica/ISR bookkeeping for
/// a single broker node.
pub struct TopicManager {
    data_dir: PathBuf,
    log_config: LogConfig,
    node_id: u64,
    topics: DashMap<String, Topic>,
    metrics: Arc<BrokerMetrics>,
}

impl TopicManager {
    pub fn new(data_dir: impl AsRef<Path>, log_config: LogConfig, node_id: u64) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            log_config,
            node_id,
            topics: DashMap::new(),
            metrics: Arc::new(BrokerMetrics::new()),
        }
    }

    /// Redirects this manager's and every partition it owns' counters
    /// into a shared [`BrokerMetrics`] instead of the private one
    /// `new` defaults to.
    pub fn with_metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Recreates `TopicManager` state from whatever topic directories
    /// already exist under `data_dir` (crash/restart recovery).
    pub fn open(
        data_dir: impl AsRef<Path>,
        log_config: LogConfig,
        node_id: u64,
        metrics: Arc<BrokerMetrics>,
    ) -> Result<Self> {
        let manager = Self::new(data_dir, log_config, node_id).with_metrics(metrics);
        let root = manager.data_dir.clone();
        if !root.exists() {
            return Ok(manager);
        }
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let topic_name = entry.file_name().to_string_lossy().to_string();
            let mut partition_count = 0u32;
            for partition_entry in std::fs::read_dir(entry.path())? {
                let partition_entry = partition_entry?;
                if partition_entry.file_type()?.is_dir() {
                    partition_count += 1;
                }
            }
            if partition_count == 0 {
                continue;
            }
            let config = TopicConfig::new(topic_name.clone(), partition_count, 1);
            manager.create_topic(config)?;
        }
        Ok(manager)
    }

    pub fn create_topic(&self, config: TopicConfig) -> Result<()> {
        if self.topics.contains_key(&config.name) {
            return Err(Error::Conflict(format!("topic {} already exists", config.name)));
        }
        if config.partition_count == 0 {
            return Err(Error::InvalidInput("partition_count must be >= 1".into()));
        }

        let topic_dir = self.data_dir.join(&config.name);
        let mut partitions = Vec::with_capacity(config.partition_count as usize);
        let mut states = Vec::with_capacity(config.partition_count as usize);
        let now_ms = 0;
        let replica_count = config.replication_factor.max(1);
        let replicas: Vec<u64> = (0..replica_count as u64).map(|i| self.node_id + i).collect();
        for id in 0..config.partition_count as PartitionId {
            let partition_dir = topic_dir.join(id.to_string());
            let log = PartitionLog::open(&partition_dir, self.log_config.clone(), now_ms)?.with_metrics(self.metrics.clone());
            partitions.push(Arc::new(log));
            states.push(PartitionState::new(id, replicas.clone(), self.node_id));
            self.metrics.active_partitions.inc();
        }

        self.topics.insert(
            config.name.clone(),
            Topic {
                config,
                partitions,
                states: RwLock::new(states),
            },
        );
        Ok(())
    }

    pub fn delete_topic(&self, name: &str) -> Result<()> {
        let (_, topic) = self
            .topics
            .remove(name)
            .ok_or_else(|| Error::NotFound(format!("topic {name}")))?;
        for partition in &topic.partitions {
            partition.delete()?;
            self.metrics.active_partitions.dec();
        }
        Ok(())
    }

    pub fn list_topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    pub fn describe_topic(&self, name: &str) -> Result<TopicMetadata> {
        let topic = self
            .topics
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("topic {name}")))?;
        let states = topic.states.read();
        let partitions = topic
            .partitions
            .iter()
            .zip(states.iter())
            .map(|(log, state)| PartitionMetadata {
                id: state.id,
                leader: state.leader,
                replicas: state.replicas.clone(),
                isr: state.isr.clone(),
                log_start_offset: log.log_start_offset(),
                high_water_mark: log.high_water_mark(),
                log_end_offset: log.log_end_offset(),
            })
            .collect();
        Ok(TopicMetadata {
            name: name.to_string(),
            partitions,
        })
    }

    pub fn partition(&self, topic: &str, partition: PartitionId) -> Result<Arc<PartitionLog>> {
        let topic_entry = self
            .topics
            .get(topic)
            .ok_or_else(|| Error::NotFound(format!("topic {topic}")))?;
        topic_entry
            .partitions
            .get(partition as usize)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("partition {topic}-{partition}")))
    }

    pub fn log_config(&self) -> &LogConfig {
        &self.log_config
    }

    pub fn topic_config(&self, topic: &str) -> Result<TopicConfig> {
        self.topics
            .get(topic)
            .map(|t| t.config.clone())
            .ok_or_else(|| Error::NotFound(format!("topic {topic}")))
    }

    /// Records that `replica` reported `leo` at `now_ms`, then
    /// recomputes the in-sync-replica set against
    /// `replica_lag_time_max_ms`.
    pub fn update_replica_fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        replica: u64,
        leo: i64,
        now_ms: i64,
        max_lag_ms: u64,
    ) -> Result<()> {
        let topic_entry = self
            .topics
            .get(topic)
            .ok_or_else(|| Error::NotFound(format!("topic {topic}")))?;
        let mut states = topic_entry.states.write();
        let state = states
            .get_mut(partition as usize)
            .ok_or_else(|| Error::NotFound(format!("partition {topic}-{partition}")))?;
        state.follower_leo.insert(replica, leo);
        state.last_fetch.insert(replica, now_ms);

        let leader_leo = topic_entry
            .partitions
            .get(partition as usize)
            .map(|log| log.log_end_offset())
            .unwrap_or(leo);

        let previous_isr = state.isr.clone();
        state.isr = state
            .replicas
            .iter()
            .copied()
            .filter(|r| {
                if *r == state.leader {
                    return true;
                }
                let caught_up = state.follower_leo.get(r).copied().unwrap_or(0) >= leader_leo;
                let fresh = state
                    .last_fetch
                    .get(r)
                    .is_some_and(|t| now_ms.saturating_sub(*t) as u64 <= max_lag_ms);
                caught_up && fresh
            })
            .collect();

        if state.isr.len() < previous_isr.len() {
            tracing::warn!(topic, partition, previous = ?previous_isr, current = ?state.isr, "ISR shrunk");
            self.metrics.isr_shrinks.inc();
        } else if state.isr.len() > previous_isr.len() {
            tracing::info!(topic, partition, previous = ?previous_isr, current = ?state.isr, "ISR expanded");
            self.metrics.isr_expansions.inc();
        }
        Ok(())
    }

    pub fn topics_snapshot(&self) -> Vec<(String, Arc<PartitionLog>, PartitionId)> {
        let mut out = Vec::new();
        for entry in self.topics.iter() {
            for (i, log) in entry.value().partitions.iter().enumerate() {
                out.push((entry.key().clone(), log.clone(), i as PartitionId));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_describe_topic() {
        let dir = tempdir().unwrap();
        let manager = TopicManager::new(dir.path(), LogConfig::default(), 1);
        manager
            .create_topic(TopicConfig::new("orders", 3, 1))
            .unwrap();
        let meta = manager.describe_topic("orders").unwrap();
        assert_eq!(meta.partitions.len(), 3);
        assert_eq!(manager.list_topics(), vec!["orders".to_string()]);
    }

    #[test]
    fn create_and_delete_topic_tracks_active_partitions() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(BrokerMetrics::new());
        let manager = TopicManager::new(dir.path(), LogConfig::default(), 1).with_metrics(metrics.clone());
        manager.create_topic(TopicConfig::new("orders", 3, 1)).unwrap();
        assert_eq!(metrics.active_partitions.get(), 3);
        manager.delete_topic("orders").unwrap();
        assert_eq!(metrics.active_partitions.get(), 0);
    }

    #[test]
    fn duplicate_topic_is_conflict() {
        let dir = tempdir().unwrap();
        let manager = TopicManager::new(dir.path(), LogConfig::default(), 1);
        manager.create_topic(TopicConfig::new("orders", 1, 1)).unwrap();
        assert!(manager.create_topic(TopicConfig::new("orders", 1, 1)).is_err());
    }

    #[test]
    fn leader_always_stays_in_isr() {
        let dir = tempdir().unwrap();
        let manager = TopicManager::new(dir.path(), LogConfig::default(), 1);
        manager.create_topic(TopicConfig::new("t", 1, 1)).unwrap();
        manager.update_replica_fetch("t", 0, 1, 0, 0, 1000).unwrap();
        let meta = manager.describe_topic("t").unwrap();
        assert_eq!(meta.partitions[0].isr, vec![1]);
    }

    #[test]
    fn replica_falling_behind_shrinks_isr_and_reports_metric() {
        let dir = tempdir().unwrap();
        let metrics = Arc::new(BrokerMetrics::new());
        let manager = TopicManager::new(dir.path(), LogConfig::default(), 1).with_metrics(metrics.clone());
        manager.create_topic(TopicConfig::new("t", 1, 2)).unwrap();

        manager.update_replica_fetch("t", 0, 2, 0, 0, 1000).unwrap();
        let meta = manager.describe_topic("t").unwrap();
        assert_eq!(meta.partitions[0].isr, vec![1, 2]);
        assert_eq!(metrics.isr_expansions.get(), 0);

        manager.update_replica_fetch("t", 0, 1, 0, 5_000, 1000).unwrap();
        let meta = manager.describe_topic("t").unwrap();
        assert_eq!(meta.partitions[0].isr, vec![1]);
        assert_eq!(metrics.isr_shrinks.get(), 1);
    }

    #[test]
    fn delete_topic_removes_partition_directories() {
        let dir = tempdir().unwrap();
        let manager = TopicManager::new(dir.path(), LogConfig::default(), 1);
        manager.create_topic(TopicConfig::new("t", 1, 1)).unwrap();
        let partition_dir = dir.path().join("t").join("0");
        assert!(partition_dir.exists());
        manager.delete_topic("t").unwrap();
        assert!(!partition_dir.exists());
    }
}
