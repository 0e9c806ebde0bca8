//! Tiered storage policy. Interface only: this crate
//! decides which tier a segment belongs in, but ships no blob-store
//! client — that lives in whatever binary wires a concrete
//! `TieredStorageBlobClient` in.
//!
//! Grounded on `rust-core/src/storage/policy.rs`'s `PolicyEngine`
//! (encode/decode of a `RedundancyStrategy`), repurposed from
//! redundancy selection to age-based tier classification, and on
//! `async_trait` is used here the same way it's used for other
//! pluggable I/O backends in this crate.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::TieredStorageConfig;
use crate::error::Result;
use crate::types::{Offset, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Hot,
    Warm,
    Cold,
}

/// Classifies a closed segment by how long ago its newest record was
/// written, relative to `now_ms`.
pub fn classify(latest_timestamp: Timestamp, now_ms: i64, config: &TieredStorageConfig) -> StorageTier {
    let age_ms = now_ms.saturating_sub(latest_timestamp) as u64;
    if age_ms >= config.tiered_cold_threshold_ms {
        StorageTier::Cold
    } else if age_ms >= config.tiered_warm_threshold_ms {
        StorageTier::Warm
    } else {
        StorageTier::Hot
    }
}

/// Metadata recorded per segment once it is offloaded to a colder
/// tier, enough for a restore to locate it again.
#[derive(Debug, Clone)]
pub struct TieredSegmentDescriptor {
    pub topic: String,
    pub partition: i32,
    pub base_offset: Offset,
    pub tier: StorageTier,
    pub remote_key: String,
    /// Local on-disk path the segment was read from before upload.
    pub path: PathBuf,
    pub size: u64,
    pub last_modified: Timestamp,
    pub last_access: Timestamp,
    /// Set once [`TieredStorageBlobClient::upload`] has completed and
    /// the local copy may be reclaimed.
    pub is_archived: bool,
}

/// Builds the descriptor for a closed segment, classifying its tier
/// from `latest_timestamp` the same way [`classify`] does. `now_ms` is
/// recorded as the initial `last_access`, since classification itself
/// counts as a touch.
#[allow(clippy::too_many_arguments)]
pub fn describe_segment(
    topic: String,
    partition: i32,
    base_offset: Offset,
    path: PathBuf,
    size: u64,
    latest_timestamp: Timestamp,
    remote_key: String,
    now_ms: i64,
    config: &TieredStorageConfig,
) -> TieredSegmentDescriptor {
    TieredSegmentDescriptor {
        topic,
        partition,
        base_offset,
        tier: classify(latest_timestamp, now_ms, config),
        remote_key,
        path,
        size,
        last_modified: latest_timestamp,
        last_access: now_ms,
        is_archived: false,
    }
}

/// The boundary this crate hands segment bytes across once they age
/// out of local disk. No implementation ships here; a deployment
/// supplies one backed by whatever object store it uses.
#[async_trait]
pub trait TieredStorageBlobClient: Send + Sync {
    async fn upload(&self, descriptor: &TieredSegmentDescriptor, bytes: &[u8]) -> Result<()>;
    async fn download(&self, descriptor: &TieredSegmentDescriptor) -> Result<Vec<u8>>;
    async fn delete(&self, descriptor: &TieredSegmentDescriptor) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_age_thresholds() {
        let config = TieredStorageConfig {
            tiered_warm_threshold_ms: 1_000,
            tiered_cold_threshold_ms: 10_000,
        };
        assert_eq!(classify(9_500, 10_000, &config), StorageTier::Hot);
        assert_eq!(classify(8_500, 10_000, &config), StorageTier::Warm);
        assert_eq!(classify(0, 10_000, &config), StorageTier::Cold);
    }

    #[test]
    fn describe_segment_fills_metadata_and_starts_unarchived() {
        let config = TieredStorageConfig {
            tiered_warm_threshold_ms: 1_000,
            tiered_cold_threshold_ms: 10_000,
        };
        let descriptor = describe_segment(
            "orders".into(),
            0,
            100,
            "/data/orders/0/00000000000000000100.log".into(),
            4096,
            0,
            "orders/0/100".into(),
            10_000,
            &config,
        );
        assert_eq!(descriptor.tier, StorageTier::Cold);
        assert_eq!(descriptor.size, 4096);
        assert_eq!(descriptor.last_access, 10_000);
        assert!(!descriptor.is_archived);
    }
}
