//! Size-classed reusable buffer pool.
//!
//! Grounded on `rust-core/src/memory/mod.rs`'s `MemoryManager` (a
//! `DashMap` of free lists keyed by size class), narrowed from a full
//! document-memory manager to just the buffer-reuse piece the log and
//! fetch paths need to avoid an allocation per record batch. Each
//! free list is a lock-free `crossbeam::queue::ArrayQueue` rather than
//! a mutex-guarded `Vec`, since pool churn (one push, one pop per
//! record batch) is exactly the contended-queue case `crossbeam`
//! targets.

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;

/// Buffers are bucketed by the next power of two at or above the
/// requested size, so a `get(100)` and a later `get(120)` share a
/// free list.
fn size_class(size: usize) -> usize {
    size.max(64).next_power_of_two()
}

/// A pool of reusable byte buffers, bucketed by power-of-two size
/// class. Safe to share across threads via `Arc`.
pub struct MemoryPool {
    free_lists: DashMap<usize, ArrayQueue<BytesMut>>,
    max_per_class: usize,
}

impl MemoryPool {
    pub fn new(max_per_class: usize) -> Self {
        Self {
            free_lists: DashMap::new(),
            max_per_class: max_per_class.max(1),
        }
    }

    /// Returns a zero-length buffer with at least `size` bytes of
    /// capacity, reused from the pool when available.
    pub fn get(&self, size: usize) -> BytesMut {
        let class = size_class(size);
        if let Some(list) = self.free_lists.get(&class) {
            if let Some(mut buf) = list.pop() {
                buf.clear();
                return buf;
            }
        }
        BytesMut::with_capacity(class)
    }

    /// Returns `buf` to the pool for reuse, dropping it instead if
    /// its class's free list is already at `max_per_class`.
    pub fn put(&self, buf: BytesMut) {
        let class = size_class(buf.capacity());
        let list = self
            .free_lists
            .entry(class)
            .or_insert_with(|| ArrayQueue::new(self.max_per_class));
        let _ = list.push(buf);
    }

    pub fn class_len(&self, size: usize) -> usize {
        let class = size_class(size);
        self.free_lists.get(&class).map(|l| l.len()).unwrap_or(0)
    }
}

impl Default for MemoryPool {
    /// Sizes each free list to roughly one buffer per core, the same
    /// heuristic `num_cpus` is used for elsewhere in the broker to
    /// size worker pools.
    fn default() -> Self {
        Self::new(num_cpus::get().max(1) * 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_buffer_of_same_class() {
        let pool = MemoryPool::new(8);
        let buf = pool.get(100);
        assert!(buf.capacity() >= 100);
        pool.put(buf);
        assert_eq!(pool.class_len(100), 1);
        let reused = pool.get(100);
        assert_eq!(pool.class_len(100), 0);
        assert!(reused.is_empty());
    }

    #[test]
    fn drops_excess_beyond_max_per_class() {
        let pool = MemoryPool::new(1);
        pool.put(BytesMut::with_capacity(128));
        pool.put(BytesMut::with_capacity(128));
        assert_eq!(pool.class_len(128), 1);
    }

    #[test]
    fn different_sizes_share_class_when_rounded_up() {
        let pool = MemoryPool::new(8);
        pool.put(BytesMut::with_capacity(130));
        assert_eq!(pool.class_len(200), 1);
    }
}
