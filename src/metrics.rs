//! Injected metrics collector: a plain struct every component holds
//! an `Arc` to, rather than an ambient global, so tests can observe
//! counters deterministically.
//!
//! Grounded on `lumadb-common::metrics`'s function-wrapped prometheus
//! counters, restructured away from the `once_cell::Lazy` global they
//! reach through.

use prometheus::{IntCounter, IntGauge};

pub struct BrokerMetrics {
    pub records_appended: IntCounter,
    pub bytes_appended: IntCounter,
    pub segments_rolled: IntCounter,
    pub retention_deletions: IntCounter,
    pub compaction_passes: IntCounter,
    pub acl_cache_hits: IntCounter,
    pub acl_cache_misses: IntCounter,
    pub schema_cache_hits: IntCounter,
    pub schema_cache_misses: IntCounter,
    pub group_rebalances: IntCounter,
    pub active_partitions: IntGauge,
    pub isr_shrinks: IntCounter,
    pub isr_expansions: IntCounter,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            records_appended: IntCounter::new(
                "corebroker_records_appended_total",
                "records appended across all partitions",
            )
            .expect("valid metric"),
            bytes_appended: IntCounter::new(
                "corebroker_bytes_appended_total",
                "bytes appended across all partitions",
            )
            .expect("valid metric"),
            segments_rolled: IntCounter::new(
                "corebroker_segments_rolled_total",
                "segment roll events",
            )
            .expect("valid metric"),
            retention_deletions: IntCounter::new(
                "corebroker_retention_deletions_total",
                "segments deleted by retention",
            )
            .expect("valid metric"),
            compaction_passes: IntCounter::new(
                "corebroker_compaction_passes_total",
                "compaction passes run",
            )
            .expect("valid metric"),
            acl_cache_hits: IntCounter::new("corebroker_acl_cache_hits_total", "ACL cache hits")
                .expect("valid metric"),
            acl_cache_misses: IntCounter::new(
                "corebroker_acl_cache_misses_total",
                "ACL cache misses",
            )
            .expect("valid metric"),
            schema_cache_hits: IntCounter::new(
                "corebroker_schema_cache_hits_total",
                "schema cache hits",
            )
            .expect("valid metric"),
            schema_cache_misses: IntCounter::new(
                "corebroker_schema_cache_misses_total",
                "schema cache misses",
            )
            .expect("valid metric"),
            group_rebalances: IntCounter::new(
                "corebroker_group_rebalances_total",
                "consumer group rebalances started",
            )
            .expect("valid metric"),
            active_partitions: IntGauge::new(
                "corebroker_active_partitions",
                "number of partitions currently open",
            )
            .expect("valid metric"),
            isr_shrinks: IntCounter::new(
                "corebroker_isr_shrinks_total",
                "in-sync-replica set shrink events",
            )
            .expect("valid metric"),
            isr_expansions: IntCounter::new(
                "corebroker_isr_expansions_total",
                "in-sync-replica set expansion events",
            )
            .expect("valid metric"),
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
