//! Partition log: the segment chain for one partition,
//! with roll, retention, compaction and high-water-mark bookkeeping.
//!
//! Grounded on `crates/lumadb-streaming/src/log/mod.rs`'s
//! `PartitionLog` (active segment behind its own lock, closed
//! segments behind a second lock, atomic offset counters), extended
//! with the on-disk segment format from [`segment`] and a
//! `tokio::sync::Notify` for long-poll fetches, the way
//! `rust-core/src/kafka/engine.rs`'s `StreamingEngine` wires fetch
//! waiters.

pub mod compaction;
pub mod retention;
pub mod segment;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::metrics::BrokerMetrics;
use crate::types::{Offset, Record, Timestamp};
use segment::{segment_file_stem, Segment};

/// One partition's append-only segment chain.
pub struct PartitionLog {
    dir: PathBuf,
    config: LogConfig,
    active: RwLock<Segment>,
    segments: RwLock<Vec<Segment>>,
    log_start_offset: AtomicI64,
    high_water_mark: AtomicI64,
    notify: Notify,
    metrics: Arc<BrokerMetrics>,
}

impl PartitionLog {
    /// Opens (recovering if segments already exist) or creates the
    /// log rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>, config: LogConfig, now_ms: i64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut base_offsets = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(base_offset) = stem.parse::<Offset>() {
                    base_offsets.push(base_offset);
                }
            }
        }
        base_offsets.sort_unstable();

        let (active, closed) = if base_offsets.is_empty() {
            (Segment::create(&dir, 0, now_ms)?, Vec::new())
        } else {
            let last = *base_offsets.last().unwrap();
            let mut closed = Vec::with_capacity(base_offsets.len() - 1);
            for base_offset in &base_offsets[..base_offsets.len() - 1] {
                closed.push(Segment::open(&dir, *base_offset, now_ms)?);
            }
            (Segment::open(&dir, last, now_ms)?, closed)
        };

        let log_start_offset = closed
            .first()
            .map(|s| s.base_offset())
            .unwrap_or_else(|| active.base_offset());
        let high_water_mark = active.next_offset();

        Ok(Self {
            dir,
            config,
            active: RwLock::new(active),
            segments: RwLock::new(closed),
            log_start_offset: AtomicI64::new(log_start_offset),
            high_water_mark: AtomicI64::new(high_water_mark),
            notify: Notify::new(),
            metrics: Arc::new(BrokerMetrics::new()),
        })
    }

    /// Redirects this log's counters into a shared [`BrokerMetrics`]
    /// instead of the private one `open` defaults to.
    pub fn with_metrics(mut self, metrics: Arc<BrokerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends `records`, rolling the active segment first if it
    /// would exceed `segment_size_limit` or `segment_ms`. Returns the
    /// offset assigned to the first record.
    pub fn append(&self, records: &[Record], now_ms: i64) -> Result<Offset> {
        if records.is_empty() {
            return Err(Error::InvalidInput("cannot append an empty batch".into()));
        }
        for record in records {
            let len = record.value.as_ref().map(|v| v.len()).unwrap_or(0)
                + record.key.as_ref().map(|k| k.len()).unwrap_or(0);
            if len > self.config.max_record_bytes {
                return Err(Error::InvalidInput(format!(
                    "record of {len} bytes exceeds max_record_bytes {}",
                    self.config.max_record_bytes
                )));
            }
        }

        let mut active = self.active.write();
        if self.should_roll(&active, now_ms) {
            self.roll_locked(&mut active, now_ms)?;
        }

        let first_offset = active.next_offset();
        for record in records {
            let offset = active.next_offset();
            let record_bytes = record.value.as_ref().map(|v| v.len()).unwrap_or(0)
                + record.key.as_ref().map(|k| k.len()).unwrap_or(0);
            active.append(offset, record, self.config.index_interval_bytes)?;
            self.metrics.records_appended.inc();
            self.metrics.bytes_appended.inc_by(record_bytes as u64);
        }
        drop(active);
        self.notify.notify_waiters();
        Ok(first_offset)
    }

    fn should_roll(&self, active: &Segment, now_ms: i64) -> bool {
        if active.is_empty() {
            return false;
        }
        active.size_bytes() >= self.config.segment_size_limit
            || now_ms.saturating_sub(active.created_at_ms()) as u64 >= self.config.segment_ms
    }

    /// Closes and archives the current active segment, replacing it
    /// with a fresh empty one starting at the old log-end offset.
    fn roll_locked(&self, active: &mut Segment, now_ms: i64) -> Result<()> {
        active.flush()?;
        let new_base = active.next_offset();
        let new_segment = Segment::create(&self.dir, new_base, now_ms)?;
        let old = std::mem::replace(active, new_segment);
        self.segments.write().push(old);
        self.metrics.segments_rolled.inc();
        Ok(())
    }

    /// Reads up to `max_bytes` starting at `start_offset`, never past
    /// the high-water mark.
    pub fn read(&self, start_offset: Offset, max_bytes: usize) -> Result<Vec<Record>> {
        let log_start = self.log_start_offset.load(Ordering::Acquire);
        let hwm = self.high_water_mark.load(Ordering::Acquire);
        if start_offset < log_start || start_offset > hwm {
            return Err(Error::OffsetOutOfRange {
                requested: start_offset,
                start: log_start,
                end: hwm,
            });
        }
        if start_offset == hwm {
            return Ok(Vec::new());
        }

        let mut remaining = max_bytes;
        let mut cursor = start_offset;
        let mut out = Vec::new();

        {
            let mut segments = self.segments.write();
            for segment in segments.iter_mut() {
                if cursor >= segment.next_offset() {
                    continue;
                }
                let (records, next) = segment.read(cursor, remaining)?;
                remaining = remaining.saturating_sub(records.iter().map(record_wire_size).sum());
                cursor = next;
                out.extend(records);
                if remaining == 0 || cursor >= hwm {
                    return Ok(out);
                }
            }
        }

        let mut active = self.active.write();
        if cursor < active.next_offset() && cursor < hwm {
            let (records, _next) = active.read(cursor, remaining)?;
            out.extend(records.into_iter().filter(|r| r.offset.unwrap_or(hwm) < hwm));
        }
        Ok(out)
    }

    /// Waits (bounded by `timeout`) until `log_end_offset() > from`,
    /// or returns immediately if already true.
    pub async fn wait_for_records(&self, from: Offset, timeout: Duration) {
        if self.log_end_offset() > from {
            return;
        }
        let notified = self.notify.notified();
        let _ = tokio::time::timeout(timeout, notified).await;
    }

    pub fn search_by_time(&self, ts: Timestamp) -> Result<Option<Offset>> {
        {
            let mut segments = self.segments.write();
            for segment in segments.iter_mut() {
                if let Some(offset) = segment.search_by_time(ts)? {
                    return Ok(Some(offset));
                }
            }
        }
        self.active.write().search_by_time(ts)
    }

    pub fn log_end_offset(&self) -> Offset {
        self.active.read().next_offset()
    }

    pub fn log_start_offset(&self) -> Offset {
        self.log_start_offset.load(Ordering::Acquire)
    }

    pub fn high_water_mark(&self) -> Offset {
        self.high_water_mark.load(Ordering::Acquire)
    }

    /// Advances the high-water mark (a leader does this once a record
    /// batch is acknowledged by enough in-sync replicas). Never moves
    /// it backwards or past the log-end offset.
    pub fn update_high_water_mark(&self, new_hwm: Offset) {
        let leo = self.log_end_offset();
        let clamped = new_hwm.min(leo);
        let previous = self.high_water_mark.fetch_max(clamped, Ordering::AcqRel);
        if clamped > previous {
            self.notify.notify_waiters();
        }
    }

    pub fn size_bytes(&self) -> u64 {
        let active_size = self.active.read().size_bytes();
        let closed_size: u64 = self.segments.read().iter().map(|s| s.size_bytes()).sum();
        active_size + closed_size
    }

    /// Total bytes held in closed segments, i.e. the bytes
    /// [`Self::compact_closed_segments`] is eligible to rewrite. The
    /// active segment is never compacted, so it is excluded.
    pub fn closed_segment_bytes(&self) -> u64 {
        self.segments.read().iter().map(|s| s.size_bytes()).sum()
    }

    /// Truncates the whole log so it contains only offsets `< offset`
    /// (used when a follower must discard diverged records after a
    /// leader change).
    pub fn truncate_to(&self, offset: Offset) -> Result<()> {
        let mut segments = self.segments.write();
        let mut active = self.active.write();

        segments.retain(|s| s.base_offset() < offset);
        if let Some(last) = segments.last_mut() {
            if offset <= last.next_offset() {
                last.truncate_to(offset)?;
            }
        }
        if offset <= active.base_offset() {
            if let Some(reopened) = segments.pop() {
                *active = reopened;
            }
        }
        let target = offset.max(active.base_offset());
        active.truncate_to(target)?;

        let leo = active.next_offset();
        self.high_water_mark.fetch_min(leo, Ordering::AcqRel);
        Ok(())
    }

    /// Deletes every file belonging to this partition.
    pub fn delete(&self) -> Result<()> {
        for segment in self.segments.read().iter() {
            segment.delete()?;
        }
        self.active.read().delete()?;
        std::fs::remove_dir_all(&self.dir).ok();
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.active.write().flush()?;
        for segment in self.segments.write().iter_mut() {
            segment.flush()?;
        }
        Ok(())
    }

    /// Applies retention, deleting eligible closed segments and
    /// advancing `log_start_offset` past them.
    pub fn apply_retention(&self, now_ms: i64) -> Result<usize> {
        let facts: Vec<retention::SegmentFacts> = {
            let segments = self.segments.read();
            let active = self.active.read();
            segments
                .iter()
                .map(|s| retention::SegmentFacts {
                    base_offset: s.base_offset(),
                    size_bytes: s.size_bytes(),
                    latest_timestamp: s.latest_timestamp(),
                    is_active: false,
                })
                .chain(std::iter::once(retention::SegmentFacts {
                    base_offset: active.base_offset(),
                    size_bytes: active.size_bytes(),
                    latest_timestamp: active.latest_timestamp(),
                    is_active: true,
                }))
                .collect()
        };
        let to_delete = retention::segments_to_delete(&facts, &self.config, now_ms);
        if to_delete.is_empty() {
            return Ok(0);
        }

        let mut segments = self.segments.write();
        let mut deleted = 0;
        segments.retain(|s| {
            if to_delete.contains(&s.base_offset()) {
                let _ = s.delete();
                deleted += 1;
                false
            } else {
                true
            }
        });
        if let Some(next_start) = segments.first().map(|s| s.base_offset()) {
            self.log_start_offset.store(next_start, Ordering::Release);
        } else {
            self.log_start_offset
                .store(self.active.read().base_offset(), Ordering::Release);
        }
        Ok(deleted)
    }

    pub fn segment_base_offsets(&self) -> Vec<Offset> {
        let mut offsets: Vec<Offset> = self.segments.read().iter().map(|s| s.base_offset()).collect();
        offsets.push(self.active.read().base_offset());
        offsets
    }

    /// Rewrites every closed segment (never the active one) into a
    /// single new segment holding only the latest record per key and
    /// dropping expired tombstones, via [`compaction::compact`]. The
    /// rewrite is staged in a temporary directory and only swapped in
    /// once fully flushed, so a crash mid-compaction leaves the
    /// original segments untouched.
    pub fn compact_closed_segments(&self, now_ms: i64, delete_retention_ms: u64) -> Result<CompactionOutcome> {
        let mut segments = self.segments.write();
        if segments.is_empty() {
            return Ok(CompactionOutcome::default());
        }

        let bytes_before: u64 = segments.iter().map(|s| s.size_bytes()).sum();
        let base_offset = segments[0].base_offset();

        let mut records = Vec::new();
        for segment in segments.iter_mut() {
            let (mut batch, _next) = segment.read(segment.base_offset(), usize::MAX)?;
            records.append(&mut batch);
        }
        let segments_compacted = segments.len();

        let compacted = compaction::compact(records, now_ms, delete_retention_ms);
        if compacted.is_empty() {
            return Ok(CompactionOutcome {
                segments_compacted: 0,
                bytes_before,
                bytes_after: bytes_before,
            });
        }

        let staging_dir = self.dir.join(".compacting");
        let _ = std::fs::remove_dir_all(&staging_dir);
        std::fs::create_dir_all(&staging_dir)?;
        let mut staged = Segment::create(&staging_dir, base_offset, now_ms)?;
        for record in &compacted {
            let offset = record
                .offset
                .ok_or_else(|| Error::Fatal("compacted record is missing its offset".into()))?;
            staged.append(offset, record, self.config.index_interval_bytes)?;
        }
        staged.flush()?;
        drop(staged);

        for segment in segments.iter() {
            segment.delete()?;
        }
        for ext in ["log", "index", "timeindex"] {
            let from = staging_dir.join(format!("{}.{ext}", segment_file_stem(base_offset)));
            let to = self.dir.join(format!("{}.{ext}", segment_file_stem(base_offset)));
            std::fs::rename(from, to)?;
        }
        let _ = std::fs::remove_dir(&staging_dir);

        let reopened = Segment::open(&self.dir, base_offset, now_ms)?;
        let bytes_after = reopened.size_bytes();
        *segments = vec![reopened];

        Ok(CompactionOutcome {
            segments_compacted,
            bytes_before,
            bytes_after,
        })
    }
}

/// Outcome of one [`PartitionLog::compact_closed_segments`] pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionOutcome {
    pub segments_compacted: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

fn record_wire_size(record: &Record) -> usize {
    8 + record.value.as_ref().map(|v| v.len()).unwrap_or(0)
        + record.key.as_ref().map(|k| k.len()).unwrap_or(0)
        + record.headers.iter().map(|(n, v)| n.len() + v.len()).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(key: &str, value: &str, ts: i64) -> Record {
        Record::new(value.as_bytes().to_vec(), ts).with_key(key.as_bytes().to_vec())
    }

    #[test]
    fn append_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let log = PartitionLog::open(dir.path(), LogConfig::default(), 0).unwrap();
        let first = log.append(&[rec("a", "1", 0), rec("b", "2", 0)], 0).unwrap();
        assert_eq!(first, 0);
        log.update_high_water_mark(2);
        let records = log.read(0, 1 << 20).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn read_at_hwm_returns_empty() {
        let dir = tempdir().unwrap();
        let log = PartitionLog::open(dir.path(), LogConfig::default(), 0).unwrap();
        log.append(&[rec("a", "1", 0)], 0).unwrap();
        log.update_high_water_mark(1);
        assert!(log.read(1, 1024).unwrap().is_empty());
    }

    #[test]
    fn read_before_log_start_errors() {
        let dir = tempdir().unwrap();
        let log = PartitionLog::open(dir.path(), LogConfig::default(), 0).unwrap();
        log.append(&[rec("a", "1", 0)], 0).unwrap();
        log.update_high_water_mark(1);
        log.apply_retention(i64::MAX).ok();
        assert!(log.read(-1, 1024).is_err());
    }

    #[test]
    fn high_water_mark_never_exceeds_log_end_offset() {
        let dir = tempdir().unwrap();
        let log = PartitionLog::open(dir.path(), LogConfig::default(), 0).unwrap();
        log.append(&[rec("a", "1", 0)], 0).unwrap();
        log.update_high_water_mark(999);
        assert_eq!(log.high_water_mark(), log.log_end_offset());
    }

    #[test]
    fn compact_closed_segments_keeps_only_latest_value_per_key() {
        let dir = tempdir().unwrap();
        let mut config = LogConfig::default();
        config.segment_size_limit = 1; // roll after every record, so each lands in its own segment
        let log = PartitionLog::open(dir.path(), config, 0).unwrap();
        log.append(&[rec("a", "1", 0)], 0).unwrap();
        log.append(&[rec("a", "2", 0)], 0).unwrap();
        log.append(&[rec("b", "x", 0)], 0).unwrap();
        log.update_high_water_mark(3);

        let before_segments = log.segment_base_offsets().len();
        let outcome = log.compact_closed_segments(1_000, 1_000).unwrap();
        assert_eq!(outcome.segments_compacted, before_segments - 1);
        assert!(outcome.bytes_after < outcome.bytes_before);

        let records = log.read(0, 1 << 20).unwrap();
        let a_values: Vec<_> = records.iter().filter(|r| r.key.as_deref() == Some(b"a")).collect();
        assert_eq!(a_values.len(), 1);
        assert_eq!(a_values[0].value.as_deref(), Some(b"2".as_slice()));
        assert!(records.iter().any(|r| r.key.as_deref() == Some(b"b")));
    }

    #[test]
    fn reopen_recovers_state() {
        let dir = tempdir().unwrap();
        {
            let log = PartitionLog::open(dir.path(), LogConfig::default(), 0).unwrap();
            log.append(&[rec("a", "1", 0), rec("b", "2", 0)], 0).unwrap();
            log.flush().unwrap();
        }
        let log = PartitionLog::open(dir.path(), LogConfig::default(), 0).unwrap();
        assert_eq!(log.log_end_offset(), 2);
    }
}
