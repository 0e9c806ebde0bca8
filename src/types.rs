//! Shared data-model types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type Offset = i64;
pub type PartitionId = i32;
pub type Timestamp = i64;

/// A unit written to and read from a log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub timestamp: Timestamp,
    #[serde(skip)]
    pub offset: Option<Offset>,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            key: None,
            value: Some(value.into()),
            headers: Vec::new(),
            timestamp,
            offset: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// A tombstone is a record with a null value.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Pattern type for ACL resource-name matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternType {
    Literal,
    Prefixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Topic,
    Group,
    Cluster,
    TransactionalId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclOperation {
    Read,
    Write,
    Create,
    Delete,
    Alter,
    Describe,
    All,
}

/// Topic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    pub partition_count: u32,
    pub replication_factor: u32,
    pub compact: bool,
    pub config_overrides: HashMap<String, String>,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>, partition_count: u32, replication_factor: u32) -> Self {
        Self {
            name: name.into(),
            partition_count,
            replication_factor,
            compact: false,
            config_overrides: HashMap::new(),
        }
    }
}

/// Per-partition replica/ISR bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionState {
    pub id: PartitionId,
    pub replicas: Vec<u64>,
    pub isr: Vec<u64>,
    pub leader: u64,
    /// Follower node id -> last reported LEO, used for ISR shrink/expand.
    pub follower_leo: HashMap<u64, Offset>,
    pub last_fetch: HashMap<u64, Timestamp>,
}

impl PartitionState {
    pub fn new(id: PartitionId, replicas: Vec<u64>, leader: u64) -> Self {
        Self {
            id,
            isr: replicas.clone(),
            replicas,
            leader,
            follower_leo: HashMap::new(),
            last_fetch: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMetadata {
    pub id: PartitionId,
    pub leader: u64,
    pub replicas: Vec<u64>,
    pub isr: Vec<u64>,
    pub log_start_offset: Offset,
    pub high_water_mark: Offset,
    pub log_end_offset: Offset,
}

/// A batch fetched/read out of a log.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<Record>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaType {
    Avro,
    Json,
    Protobuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompatibilityMode {
    None,
    Backward,
    Forward,
    Full,
    BackwardTransitive,
    ForwardTransitive,
    FullTransitive,
}

impl CompatibilityMode {
    /// Whether this mode checks against every prior version rather
    /// than just the latest one.
    pub fn is_transitive(self) -> bool {
        matches!(
            self,
            CompatibilityMode::BackwardTransitive
                | CompatibilityMode::ForwardTransitive
                | CompatibilityMode::FullTransitive
        )
    }

    pub fn checks_backward(self) -> bool {
        matches!(
            self,
            CompatibilityMode::Backward
                | CompatibilityMode::Full
                | CompatibilityMode::BackwardTransitive
                | CompatibilityMode::FullTransitive
        )
    }

    pub fn checks_forward(self) -> bool {
        matches!(
            self,
            CompatibilityMode::Forward
                | CompatibilityMode::Full
                | CompatibilityMode::ForwardTransitive
                | CompatibilityMode::FullTransitive
        )
    }
}
