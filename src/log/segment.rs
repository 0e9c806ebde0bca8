//! Segment: one (base-offset, `.log`, `.index`,
//! `.timeindex`) triple.
//!
//! Grounded on `rust-core/src/storage/sstable.rs`'s footer/index/mmap
//! shape, adapted from a sorted-string table to an append-only,
//! offset-ordered record log, and on `rust-core/src/kafka/engine.rs`'s
//! `EngineConfig` (segment_size, index_interval_bytes already named
//! there). Index/timeindex entries and the record frame header are
//! fixed-width big-endian integers, via `byteorder`. Each record frame
//! also carries its own absolute offset, so a segment produced by
//! compaction can hold non-contiguous offsets.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::types::{Offset, Record, Timestamp};

const BASE_OFFSET_WIDTH: usize = 20;

pub fn segment_file_stem(base_offset: Offset) -> String {
    format!("{base_offset:0width$}", width = BASE_OFFSET_WIDTH)
}

fn log_path(dir: &Path, base_offset: Offset) -> PathBuf {
    dir.join(format!("{}.log", segment_file_stem(base_offset)))
}
fn index_path(dir: &Path, base_offset: Offset) -> PathBuf {
    dir.join(format!("{}.index", segment_file_stem(base_offset)))
}
fn timeindex_path(dir: &Path, base_offset: Offset) -> PathBuf {
    dir.join(format!("{}.timeindex", segment_file_stem(base_offset)))
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    relative_offset: u32,
    position: u32,
}

#[derive(Debug, Clone, Copy)]
struct TimeIndexEntry {
    timestamp: i64,
    relative_offset: u32,
}

/// A single immutable-once-rolled segment of one partition's log.
pub struct Segment {
    base_offset: Offset,
    log_path: PathBuf,
    index_path: PathBuf,
    timeindex_path: PathBuf,
    log_file: File,
    size: u64,
    index: Vec<IndexEntry>,
    timeindex: Vec<TimeIndexEntry>,
    bytes_since_index: u64,
    next_relative_offset: u32,
    min_timestamp: Option<Timestamp>,
    max_timestamp: Timestamp,
    created_at_ms: i64,
    dirty: bool,
}

impl Segment {
    /// Creates a brand-new, empty segment rooted at `base_offset`.
    pub fn create(dir: &Path, base_offset: Offset, now_ms: i64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let log_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(log_path(dir, base_offset))?;
        File::create(index_path(dir, base_offset))?;
        File::create(timeindex_path(dir, base_offset))?;
        Ok(Self {
            base_offset,
            log_path: log_path(dir, base_offset),
            index_path: index_path(dir, base_offset),
            timeindex_path: timeindex_path(dir, base_offset),
            log_file,
            size: 0,
            index: Vec::new(),
            timeindex: Vec::new(),
            bytes_since_index: 0,
            next_relative_offset: 0,
            min_timestamp: None,
            max_timestamp: i64::MIN,
            created_at_ms: now_ms,
            dirty: false,
        })
    }

    /// Opens an existing segment directory entry, recovering the
    /// index from the log if it trails, and truncating any partial
    /// trailing record left by an unclean shutdown.
    pub fn open(dir: &Path, base_offset: Offset, now_ms: i64) -> Result<Self> {
        let lp = log_path(dir, base_offset);
        let mut log_file = OpenOptions::new().read(true).write(true).open(&lp)?;
        let log_len = log_file.metadata()?.len();

        let mut index = read_index(&index_path(dir, base_offset))?;
        let mut timeindex = read_timeindex(&timeindex_path(dir, base_offset))?;

        let indexed_position = index.last().map(|e| e.position as u64).unwrap_or(0);
        let mut scan_pos = if index.is_empty() { 0 } else { indexed_position };
        let mut relative_offset = index.last().map(|e| e.relative_offset).unwrap_or(0);
        if !index.is_empty() {
            // The indexed position is the start of a known-good record; skip past it.
            log_file.seek(SeekFrom::Start(scan_pos))?;
            if let Some((rec, next_pos, _ts)) = try_read_record_at(&mut log_file, scan_pos, log_len)? {
                scan_pos = next_pos;
                relative_offset = (rec.offset.unwrap() - base_offset) as u32 + 1;
            }
        }

        let mut min_timestamp = timeindex.first().map(|e| e.timestamp);
        let mut max_timestamp = timeindex.last().map(|e| e.timestamp).unwrap_or(i64::MIN);
        let mut bytes_since_index = 0u64;
        let mut valid_end = scan_pos;

        loop {
            log_file.seek(SeekFrom::Start(valid_end))?;
            match try_read_record_at(&mut log_file, valid_end, log_len)? {
                Some((record, next_pos, consumed)) => {
                    if min_timestamp.is_none() {
                        min_timestamp = Some(record.timestamp);
                    }
                    max_timestamp = max_timestamp.max(record.timestamp);
                    bytes_since_index += consumed;
                    valid_end = next_pos;
                    relative_offset = (record.offset.unwrap() - base_offset) as u32 + 1;
                }
                None => break,
            }
        }

        if valid_end < log_len {
            // Partial trailing record: length-prefix claimed more bytes than followed it.
            log_file.set_len(valid_end)?;
        }

        index.retain(|e| (e.position as u64) <= valid_end);
        timeindex.retain(|e| e.relative_offset < relative_offset);

        Ok(Self {
            base_offset,
            log_path: lp,
            index_path: index_path(dir, base_offset),
            timeindex_path: timeindex_path(dir, base_offset),
            log_file,
            size: valid_end,
            index,
            timeindex,
            bytes_since_index,
            next_relative_offset: relative_offset,
            min_timestamp,
            max_timestamp,
            created_at_ms: now_ms,
            dirty: false,
        })
    }

    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    pub fn is_empty(&self) -> bool {
        self.next_relative_offset == 0
    }

    pub fn highest_offset(&self) -> Option<Offset> {
        if self.next_relative_offset == 0 {
            None
        } else {
            Some(self.base_offset + self.next_relative_offset as i64 - 1)
        }
    }

    pub fn next_offset(&self) -> Offset {
        self.base_offset + self.next_relative_offset as i64
    }

    pub fn size_bytes(&self) -> u64 {
        self.size
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn oldest_timestamp(&self) -> Option<Timestamp> {
        self.min_timestamp
    }

    pub fn latest_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Appends one record at `offset`, which must be `>= next_offset()`
    /// (the caller, `PartitionLog`, owns the global offset counter).
    /// Ordinary appends are always exactly `next_offset()`; a
    /// compacted rewrite may pass an offset past a gap left by a
    /// removed key, since the on-disk frame carries its own offset.
    /// Returns the byte length written.
    pub fn append(&mut self, offset: Offset, record: &Record, index_interval_bytes: u32) -> Result<u64> {
        if self.dirty {
            return Err(Error::Fatal(format!(
                "segment {} is quarantined after a prior write failure",
                self.base_offset
            )));
        }
        if offset < self.next_offset() {
            return Err(Error::InvalidInput(format!(
                "out-of-order append: expected offset >= {}, got {offset}",
                self.next_offset()
            )));
        }

        let relative_offset = (offset - self.base_offset) as u32;
        let position = self.size;
        let payload = encode_record(offset, record);
        let write_result = (|| -> Result<u64> {
            self.log_file.seek(SeekFrom::Start(position))?;
            let mut framed = Vec::with_capacity(payload.len() + 8);
            framed.write_u32::<BigEndian>(payload.len() as u32)?;
            framed.write_u32::<BigEndian>(crc32fast::hash(&payload))?;
            framed.extend_from_slice(&payload);
            self.log_file.write_all(&framed)?;
            Ok(framed.len() as u64)
        })();

        let written = match write_result {
            Ok(n) => n,
            Err(e) => {
                self.dirty = true;
                return Err(Error::Fatal(format!("segment append failed: {e}")));
            }
        };

        self.bytes_since_index += written;
        if self.index.is_empty() || self.bytes_since_index >= index_interval_bytes as u64 {
            self.index.push(IndexEntry {
                relative_offset,
                position: position as u32,
            });
            self.timeindex.push(TimeIndexEntry {
                timestamp: record.timestamp,
                relative_offset,
            });
            self.bytes_since_index = 0;
        }

        self.size += written;
        self.next_relative_offset = relative_offset + 1;
        self.min_timestamp.get_or_insert(record.timestamp);
        self.max_timestamp = self.max_timestamp.max(record.timestamp);
        Ok(written)
    }

    /// Reads records starting at `start_offset`, returning as many
    /// whole records as fit within `max_bytes`, plus the offset to
    /// resume at.
    pub fn read(&mut self, start_offset: Offset, max_bytes: usize) -> Result<(Vec<Record>, Offset)> {
        if start_offset < self.base_offset || start_offset > self.next_offset() {
            return Ok((Vec::new(), start_offset));
        }
        let target_relative = (start_offset - self.base_offset) as u32;
        let start_pos = self.position_for_relative_offset(target_relative);

        self.log_file.seek(SeekFrom::Start(start_pos))?;
        let log_len = self.size;
        let mut pos = start_pos;
        let mut next_offset = start_offset;
        let mut records = Vec::new();
        let mut consumed = 0usize;

        while pos < log_len {
            match try_read_record_at(&mut self.log_file, pos, log_len)? {
                Some((record, next_pos, framed_len)) => {
                    let absolute = record.offset.unwrap();
                    if absolute >= start_offset {
                        if consumed > 0 && consumed as u64 + framed_len > max_bytes as u64 {
                            break;
                        }
                        records.push(record);
                        consumed += framed_len as usize;
                    }
                    pos = next_pos;
                    next_offset = absolute + 1;
                }
                None => break,
            }
        }

        Ok((records, next_offset))
    }

    /// Finds the first offset with `timestamp >= ts`, or `None` if no
    /// such record exists in this segment.
    pub fn search_by_time(&mut self, ts: Timestamp) -> Result<Option<Offset>> {
        let start_pos = {
            let idx = self
                .timeindex
                .partition_point(|e| e.timestamp <= ts);
            if idx == 0 {
                0
            } else {
                self.position_for_relative_offset(self.timeindex[idx - 1].relative_offset)
            }
        };

        let mut pos = start_pos;
        self.log_file.seek(SeekFrom::Start(pos))?;
        while pos < self.size {
            match try_read_record_at(&mut self.log_file, pos, self.size)? {
                Some((record, next_pos, _)) => {
                    if record.timestamp >= ts {
                        return Ok(Some(record.offset.unwrap()));
                    }
                    pos = next_pos;
                }
                None => break,
            }
        }
        Ok(None)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.log_file.sync_all()?;
        write_index(&self.index_path, &self.index)?;
        write_timeindex(&self.timeindex_path, &self.timeindex)?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.flush()
    }

    /// Truncates this segment so it contains only offsets `< offset`.
    pub fn truncate_to(&mut self, offset: Offset) -> Result<()> {
        if offset <= self.base_offset {
            self.log_file.set_len(0)?;
            self.size = 0;
            self.index.clear();
            self.timeindex.clear();
            self.next_relative_offset = 0;
            self.min_timestamp = None;
            self.max_timestamp = i64::MIN;
            return Ok(());
        }
        let target_relative = (offset - self.base_offset) as u32;
        if target_relative >= self.next_relative_offset {
            return Ok(());
        }
        let position = self.position_for_relative_offset(target_relative);
        self.log_file.seek(SeekFrom::Start(position))?;
        let mut pos = position;
        let mut max_timestamp = i64::MIN;
        let mut kept_next_relative = self.relative_offset_at_position(position);
        loop {
            match try_read_record_at(&mut self.log_file, pos, self.size)? {
                Some((record, next_pos, _)) => {
                    let rec_relative = (record.offset.unwrap() - self.base_offset) as u32;
                    if rec_relative >= target_relative {
                        break;
                    }
                    max_timestamp = max_timestamp.max(record.timestamp);
                    pos = next_pos;
                    kept_next_relative = rec_relative + 1;
                }
                None => break,
            }
        }
        self.log_file.set_len(pos)?;
        self.size = pos;
        self.next_relative_offset = kept_next_relative;
        self.index.retain(|e| e.relative_offset < target_relative);
        self.timeindex.retain(|e| e.relative_offset < target_relative);
        self.max_timestamp = self
            .timeindex
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(max_timestamp);
        self.flush()
    }

    pub fn delete(&self) -> Result<()> {
        let _ = std::fs::remove_file(&self.log_path);
        let _ = std::fs::remove_file(&self.index_path);
        let _ = std::fs::remove_file(&self.timeindex_path);
        Ok(())
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn position_for_relative_offset(&self, target: u32) -> u64 {
        let idx = self
            .index
            .partition_point(|e| e.relative_offset <= target);
        if idx == 0 {
            0
        } else {
            self.index[idx - 1].position as u64
        }
    }

    fn relative_offset_at_position(&self, position: u64) -> u32 {
        let idx = self.index.partition_point(|e| (e.position as u64) <= position);
        if idx == 0 {
            0
        } else {
            self.index[idx - 1].relative_offset
        }
    }
}

/// Reads the 8-byte frame header plus payload at `pos`, returning the
/// decoded record, the position immediately after it, and the framed
/// byte length. Returns `Ok(None)` on a short/partial trailing record.
fn try_read_record_at(file: &mut File, pos: u64, log_len: u64) -> Result<Option<(Record, u64, u64)>> {
    if pos + 8 > log_len {
        return Ok(None);
    }
    file.seek(SeekFrom::Start(pos))?;
    let len = match file.read_u32::<BigEndian>() {
        Ok(v) => v as u64,
        Err(_) => return Ok(None),
    };
    let crc = match file.read_u32::<BigEndian>() {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if pos + 8 + len > log_len {
        return Ok(None);
    }
    let mut payload = vec![0u8; len as usize];
    if file.read_exact(&mut payload).is_err() {
        return Ok(None);
    }
    if crc32fast::hash(&payload) != crc {
        return Ok(None);
    }
    let record = decode_record(&payload)?;
    Ok(Some((record, pos + 8 + len, 8 + len)))
}

fn encode_record(offset: Offset, record: &Record) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_i64::<BigEndian>(offset).unwrap();
    buf.write_i64::<BigEndian>(record.timestamp).unwrap();
    write_optional_bytes(&mut buf, record.key.as_deref());
    write_optional_bytes(&mut buf, record.value.as_deref());
    buf.write_u32::<BigEndian>(record.headers.len() as u32).unwrap();
    for (name, value) in &record.headers {
        let name_bytes = name.as_bytes();
        buf.write_u32::<BigEndian>(name_bytes.len() as u32).unwrap();
        buf.extend_from_slice(name_bytes);
        write_optional_bytes(&mut buf, Some(value.as_slice()));
    }
    buf
}

fn decode_record(buf: &[u8]) -> Result<Record> {
    let mut cursor = std::io::Cursor::new(buf);
    let offset = cursor
        .read_i64::<BigEndian>()
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let timestamp = cursor
        .read_i64::<BigEndian>()
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let key = read_optional_bytes(&mut cursor)?;
    let value = read_optional_bytes(&mut cursor)?;
    let header_count = cursor
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let mut headers = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        let name_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Serialization(e.to_string()))? as usize;
        let mut name_bytes = vec![0u8; name_len];
        cursor
            .read_exact(&mut name_bytes)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let name = String::from_utf8(name_bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        let value = read_optional_bytes(&mut cursor)?.unwrap_or_default();
        headers.push((name, value));
    }
    Ok(Record {
        key,
        value,
        headers,
        timestamp,
        offset: Some(offset),
    })
}

fn write_optional_bytes(buf: &mut Vec<u8>, data: Option<&[u8]>) {
    match data {
        Some(bytes) => {
            buf.write_i32::<BigEndian>(bytes.len() as i32).unwrap();
            buf.extend_from_slice(bytes);
        }
        None => {
            buf.write_i32::<BigEndian>(-1).unwrap();
        }
    }
}

fn read_optional_bytes(cursor: &mut std::io::Cursor<&[u8]>) -> Result<Option<Vec<u8>>> {
    let len = cursor
        .read_i32::<BigEndian>()
        .map_err(|e| Error::Serialization(e.to_string()))?;
    if len < 0 {
        return Ok(None);
    }
    let mut bytes = vec![0u8; len as usize];
    cursor
        .read_exact(&mut bytes)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    Ok(Some(bytes))
}

fn read_index(path: &Path) -> Result<Vec<IndexEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut entries = Vec::new();
    loop {
        let relative_offset = match file.read_u32::<BigEndian>() {
            Ok(v) => v,
            Err(_) => break,
        };
        let position = file
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        entries.push(IndexEntry {
            relative_offset,
            position,
        });
    }
    Ok(entries)
}

fn write_index(path: &Path, entries: &[IndexEntry]) -> Result<()> {
    let mut file = File::create(path)?;
    for e in entries {
        file.write_u32::<BigEndian>(e.relative_offset)?;
        file.write_u32::<BigEndian>(e.position)?;
    }
    file.sync_all()?;
    Ok(())
}

fn read_timeindex(path: &Path) -> Result<Vec<TimeIndexEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let mut entries = Vec::new();
    loop {
        let timestamp = match file.read_i64::<BigEndian>() {
            Ok(v) => v,
            Err(_) => break,
        };
        let relative_offset = file
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        entries.push(TimeIndexEntry {
            timestamp,
            relative_offset,
        });
    }
    Ok(entries)
}

fn write_timeindex(path: &Path, entries: &[TimeIndexEntry]) -> Result<()> {
    let mut file = File::create(path)?;
    for e in entries {
        file.write_i64::<BigEndian>(e.timestamp)?;
        file.write_u32::<BigEndian>(e.relative_offset)?;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(key: &str, value: &str, ts: i64) -> Record {
        Record::new(value.as_bytes().to_vec(), ts).with_key(key.as_bytes().to_vec())
    }

    #[test]
    fn append_then_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 0, 0).unwrap();
        seg.append(0, &rec("k1", "v1", 1000), 4096).unwrap();
        seg.append(1, &rec("k2", "v2", 1000), 4096).unwrap();
        seg.append(2, &rec("k3", "v3", 1000), 4096).unwrap();

        let (records, next) = seg.read(0, 1 << 20).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key.as_deref(), Some(b"k1".as_slice()));
        assert_eq!(records[2].offset, Some(2));
        assert_eq!(next, 3);
    }

    #[test]
    fn read_respects_max_bytes() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 0, 0).unwrap();
        for i in 0..5 {
            seg.append(i, &rec("k", "0123456789", 1000), 4096).unwrap();
        }
        let (records, next) = seg.read(0, 40).unwrap();
        assert!(records.len() < 5);
        assert_eq!(next, records.len() as i64);
    }

    #[test]
    fn search_by_time_finds_first_ge() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 0, 0).unwrap();
        seg.append(0, &rec("k", "v", 100), 4096).unwrap();
        seg.append(1, &rec("k", "v", 200), 4096).unwrap();
        seg.append(2, &rec("k", "v", 300), 4096).unwrap();
        assert_eq!(seg.search_by_time(150).unwrap(), Some(1));
        assert_eq!(seg.search_by_time(300).unwrap(), Some(2));
        assert_eq!(seg.search_by_time(301).unwrap(), None);
    }

    #[test]
    fn recovery_truncates_partial_trailing_record() {
        let dir = tempdir().unwrap();
        {
            let mut seg = Segment::create(dir.path(), 0, 0).unwrap();
            seg.append(0, &rec("k", "v", 100), 4096).unwrap();
            seg.flush().unwrap();
        }
        // Corrupt: append a truncated frame header claiming more data than exists.
        {
            use std::io::Write as _;
            let mut f = OpenOptions::new()
                .append(true)
                .open(log_path(dir.path(), 0))
                .unwrap();
            f.write_u32::<BigEndian>(100).unwrap();
            f.write_u32::<BigEndian>(0xDEADBEEF).unwrap();
            f.write_all(b"short").unwrap();
        }
        let seg = Segment::open(dir.path(), 0, 0).unwrap();
        assert_eq!(seg.next_offset(), 1);
    }

    #[test]
    fn append_accepts_gapped_offsets_and_read_reports_them() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 10, 0).unwrap();
        seg.append(10, &rec("k1", "v1", 100), 4096).unwrap();
        // offset 11 was dropped by compaction; the next surviving record is 12.
        seg.append(12, &rec("k3", "v3", 300), 4096).unwrap();
        assert_eq!(seg.next_offset(), 13);

        let (records, next) = seg.read(10, 1 << 20).unwrap();
        assert_eq!(records.iter().map(|r| r.offset.unwrap()).collect::<Vec<_>>(), vec![10, 12]);
        assert_eq!(next, 13);
    }

    #[test]
    fn truncate_to_removes_tail() {
        let dir = tempdir().unwrap();
        let mut seg = Segment::create(dir.path(), 0, 0).unwrap();
        for i in 0..5 {
            seg.append(i, &rec("k", "v", 1000 + i), 4096).unwrap();
        }
        seg.truncate_to(3).unwrap();
        assert_eq!(seg.next_offset(), 3);
        let (records, _) = seg.read(0, 1 << 20).unwrap();
        assert_eq!(records.len(), 3);
    }
}
