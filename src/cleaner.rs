//! Background cleaner: periodic retention and compaction
//! sweeps over every partition.
//!
//! Grounded on `rust-core/src/compaction/mod.rs`'s scheduling shape
//! (a `tokio::time::interval` loop that locks one partition at a time
//! rather than the whole manager) and `crates/lumadb-common`'s use of
//! `tracing` for structured per-sweep logging.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::log::compaction;
use crate::manager::TopicManager;
use crate::metrics::BrokerMetrics;

/// Owns the background retention/compaction task. Dropping this does
/// not stop the task — call [`BackgroundCleaner::shutdown`] first.
pub struct BackgroundCleaner {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl BackgroundCleaner {
    pub fn spawn(
        manager: Arc<TopicManager>,
        metrics: Arc<BrokerMetrics>,
        sweep_interval: Duration,
        delete_retention_ms: u64,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_sweep(&manager, &metrics, delete_retention_ms);
                    }
                    _ = shutdown_rx.notified() => {
                        debug!("background cleaner shutting down");
                        break;
                    }
                }
            }
        });
        Self { handle, shutdown }
    }

    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}

fn run_sweep(manager: &TopicManager, metrics: &BrokerMetrics, delete_retention_ms: u64) {
    let now_ms = current_time_ms();
    for (topic, log, partition) in manager.topics_snapshot() {
        match log.apply_retention(now_ms) {
            Ok(deleted) if deleted > 0 => {
                info!(topic, partition, deleted, "retention deleted segments");
                metrics.retention_deletions.inc_by(deleted as u64);
            }
            Ok(_) => {}
            Err(e) => warn!(topic, partition, error = %e, "retention sweep failed"),
        }

        if let Ok(config) = manager.topic_config(&topic) {
            if config.compact {
                let dirty = log.closed_segment_bytes();
                let total = log.size_bytes().max(1);
                if compaction::should_compact(dirty, total, manager.log_config()) {
                    match log.compact_closed_segments(now_ms, delete_retention_ms) {
                        Ok(outcome) if outcome.segments_compacted > 0 => {
                            info!(
                                topic,
                                partition,
                                segments_compacted = outcome.segments_compacted,
                                bytes_before = outcome.bytes_before,
                                bytes_after = outcome.bytes_after,
                                "compaction pass completed"
                            );
                            metrics.compaction_passes.inc();
                        }
                        Ok(_) => {}
                        Err(e) => warn!(topic, partition, error = %e, "compaction pass failed"),
                    }
                }
            }
        }
    }
}

fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
