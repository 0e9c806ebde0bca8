//! Size- and time-based retention.
//!
//! Grounded on `rust-core/src/kafka/engine.rs`'s `EngineConfig`
//! (`retention_ms`, `retention_bytes` already named there) and
//! `rust-core/src/compaction/mod.rs`'s separation of "decide what to
//! drop" from "apply the drop", which this module mirrors for
//! retention instead of compaction.

use crate::config::LogConfig;
use crate::types::{Offset, Timestamp};

/// One segment's retention-relevant facts, decoupled from `Segment`
/// itself so the policy can be unit tested without touching disk.
#[derive(Debug, Clone, Copy)]
pub struct SegmentFacts {
    pub base_offset: Offset,
    pub size_bytes: u64,
    pub latest_timestamp: Timestamp,
    pub is_active: bool,
}

/// Returns the base offsets of segments eligible for retention
/// deletion, oldest first. Never selects the active segment, and
/// never selects past the point where deleting would leave the log
/// with nothing (the newest segment always survives).
pub fn segments_to_delete(segments: &[SegmentFacts], config: &LogConfig, now_ms: i64) -> Vec<Offset> {
    if segments.len() <= 1 {
        return Vec::new();
    }
    let mut total_size: u64 = segments.iter().map(|s| s.size_bytes).sum();
    let mut to_delete = Vec::new();

    for segment in &segments[..segments.len() - 1] {
        if segment.is_active {
            continue;
        }
        let mut expired_by_time = false;
        if let Some(retention_ms) = config.retention_ms {
            expired_by_time = now_ms.saturating_sub(segment.latest_timestamp) as u64 >= retention_ms;
        }
        let expired_by_size = config
            .retention_bytes
            .is_some_and(|limit| total_size > limit);

        if expired_by_time || expired_by_size {
            to_delete.push(segment.base_offset);
            total_size = total_size.saturating_sub(segment.size_bytes);
        }
    }
    to_delete
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(base_offset: Offset, size_bytes: u64, latest_timestamp: Timestamp, is_active: bool) -> SegmentFacts {
        SegmentFacts {
            base_offset,
            size_bytes,
            latest_timestamp,
            is_active,
        }
    }

    #[test]
    fn keeps_active_segment_always() {
        let mut config = LogConfig::default();
        config.retention_ms = Some(1);
        let segments = vec![facts(0, 100, 0, true)];
        assert!(segments_to_delete(&segments, &config, 10_000).is_empty());
    }

    #[test]
    fn deletes_time_expired_segments() {
        let mut config = LogConfig::default();
        config.retention_ms = Some(1_000);
        config.retention_bytes = None;
        let segments = vec![facts(0, 100, 0, false), facts(100, 100, 9_500, false), facts(200, 100, 10_000, true)];
        let deleted = segments_to_delete(&segments, &config, 10_000);
        assert_eq!(deleted, vec![0]);
    }

    #[test]
    fn deletes_until_under_size_budget() {
        let mut config = LogConfig::default();
        config.retention_ms = None;
        config.retention_bytes = Some(150);
        let segments = vec![facts(0, 100, 0, false), facts(100, 100, 0, false), facts(200, 100, 0, true)];
        let deleted = segments_to_delete(&segments, &config, 0);
        assert_eq!(deleted, vec![0, 100]);
    }
}
