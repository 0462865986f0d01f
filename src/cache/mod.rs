// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-file read cache.
//!
//! The cache is a totally ordered set of non-overlapping byte intervals.
//! An interval either carries data or is a placeholder reserving the range
//! for an asynchronous read that is still in flight; placeholders suppress
//! duplicate prefetch of the same range and never satisfy hits.

use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;

pub use crate::cfg::config::RemovalPolicy;

/// Aggregate hit/miss counters of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Bytes served from cached intervals.
    pub bytes_hit: u64,
    /// Bytes inserted through `submit`.
    pub bytes_submitted: u64,
    /// Reads that could not be served at all.
    pub miss_count: u64,
    /// All attempted reads, hit or miss.
    pub reads_count: u64,
}

impl CacheStats {
    pub fn miss_rate(&self) -> f32 {
        if self.reads_count == 0 {
            0.0
        } else {
            self.miss_count as f32 / self.reads_count as f32
        }
    }

    pub fn usefulness(&self) -> f32 {
        if self.bytes_submitted == 0 {
            0.0
        } else {
            self.bytes_hit as f32 / self.bytes_submitted as f32
        }
    }
}

#[derive(Debug, Clone)]
struct CacheItem {
    begin: i64,
    /// Exclusive end offset.
    end: i64,
    /// `None` marks a placeholder.
    data: Option<Bytes>,
    /// Bumped on every reference; drives LRU eviction.
    tick: u64,
    /// Insertion order; drives FIFO eviction.
    seq: u64,
}

impl CacheItem {
    fn len(&self) -> u64 {
        (self.end - self.begin) as u64
    }

    fn is_placeholder(&self) -> bool {
        self.data.is_none()
    }
}

#[derive(Debug)]
struct CacheInner {
    items: Vec<CacheItem>,
    capacity: u64,
    policy: RemovalPolicy,
    tick: u64,
    seq: u64,
    data_bytes: u64,
    stats: CacheStats,
}

/// Offset-keyed variable-interval read cache.
#[derive(Debug)]
pub struct ReadCache {
    inner: Mutex<CacheInner>,
}

impl ReadCache {
    fn guard(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn new(capacity: u64, policy: RemovalPolicy) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                items: Vec::new(),
                capacity,
                policy,
                tick: 0,
                seq: 0,
                data_bytes: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    /// Whether a block of `bytes` could ever be inserted.
    pub fn will_fit(&self, bytes: u64) -> bool {
        bytes < self.guard().capacity
    }

    pub fn capacity(&self) -> u64 {
        self.guard().capacity
    }

    /// Bytes currently held in data intervals.
    pub fn data_bytes(&self) -> u64 {
        self.guard().data_bytes
    }

    /// Grows or shrinks the capacity; shrinking evicts immediately.
    pub fn set_capacity(&self, capacity: u64) {
        let mut g = self.guard();
        g.capacity = capacity;
        g.make_room(0);
    }

    pub fn stats(&self) -> CacheStats {
        self.guard().stats
    }

    /// Copies cached bytes starting at `offset` into `buf`. Copying walks
    /// adjacent data intervals and stops at the first gap or placeholder.
    /// Returns the number of bytes delivered; 0 means a miss.
    pub fn get(&self, offset: i64, buf: &mut [u8], update_stats: bool) -> usize {
        let mut g = self.guard();
        g.tick += 1;
        let tick = g.tick;
        if update_stats {
            g.stats.reads_count += 1;
        }

        let mut copied = 0usize;
        let mut cur = offset;
        let end = offset + buf.len() as i64;

        let mut idx = g.items.partition_point(|it| it.end <= cur);
        while copied < buf.len() {
            let Some(item) = g.items.get_mut(idx) else { break };
            if item.begin > cur {
                break;
            }
            let Some(data) = item.data.as_ref() else { break };
            let from = (cur - item.begin) as usize;
            let upto = ((end.min(item.end)) - item.begin) as usize;
            buf[copied..copied + (upto - from)].copy_from_slice(&data[from..upto]);
            copied += upto - from;
            cur = item.begin + upto as i64;
            item.tick = tick;
            idx += 1;
        }

        if update_stats {
            if copied == 0 {
                g.stats.miss_count += 1;
            } else {
                g.stats.bytes_hit += copied as u64;
            }
        }
        copied
    }

    /// Inserts a data interval, replacing any placeholder it satisfies and
    /// trimming overlapping neighbors so intervals never overlap. Returns
    /// false when the block cannot fit at all.
    pub fn submit(&self, offset: i64, data: Bytes) -> bool {
        if data.is_empty() {
            return true;
        }
        let mut g = self.guard();
        let len = data.len() as u64;
        if !g.make_room(len) {
            // Still resolve the reservation: the async read is finished.
            g.carve(offset, offset + data.len() as i64);
            return false;
        }
        let end = offset + data.len() as i64;
        g.carve(offset, end);
        g.tick += 1;
        g.seq += 1;
        let item = CacheItem {
            begin: offset,
            end,
            data: Some(data),
            tick: g.tick,
            seq: g.seq,
        };
        let pos = g.items.partition_point(|it| it.begin < offset);
        g.items.insert(pos, item);
        g.data_bytes += len;
        g.stats.bytes_submitted += len;
        true
    }

    /// Reserves `[begin, end)` for an outstanding async read. Portions
    /// already covered by any interval are left untouched.
    pub fn put_placeholder(&self, begin: i64, end: i64) {
        if end <= begin {
            return;
        }
        let mut g = self.guard();
        // Collect the uncovered gaps first; inserting while walking would
        // invalidate the scan.
        let mut gaps: Vec<(i64, i64)> = Vec::new();
        let mut cur = begin;
        let mut idx = g.items.partition_point(|it| it.end <= begin);
        while cur < end {
            match g.items.get(idx) {
                Some(it) if it.begin < end => {
                    if it.begin > cur {
                        gaps.push((cur, it.begin));
                    }
                    cur = it.end.max(cur);
                    idx += 1;
                }
                _ => {
                    gaps.push((cur, end));
                    break;
                }
            }
        }
        for (b, e) in gaps {
            g.tick += 1;
            g.seq += 1;
            let item =
                CacheItem { begin: b, end: e, data: None, tick: g.tick, seq: g.seq };
            let pos = g.items.partition_point(|it| it.begin < b);
            g.items.insert(pos, item);
        }
    }

    /// Is any part of `[begin, end)` already covered by data or reserved
    /// by a placeholder?
    pub fn covered(&self, begin: i64, end: i64) -> bool {
        let g = self.guard();
        let idx = g.items.partition_point(|it| it.end <= begin);
        matches!(g.items.get(idx), Some(it) if it.begin < end)
    }

    /// Drops every interval overlapping `[begin, end)`, trimming partial
    /// overlaps. Placeholders in the range are dropped as well.
    pub fn remove(&self, begin: i64, end: i64) {
        let mut g = self.guard();
        g.carve(begin, end);
    }

    /// Drops only placeholders overlapping the range; used when the async
    /// read that reserved it failed.
    pub fn remove_placeholder(&self, begin: i64, end: i64) {
        let mut g = self.guard();
        let mut idx = g.items.partition_point(|it| it.end <= begin);
        while idx < g.items.len() {
            if g.items[idx].begin >= end {
                break;
            }
            if g.items[idx].is_placeholder() {
                g.items.remove(idx);
            } else {
                idx += 1;
            }
        }
    }

    /// Number of live placeholders, each standing for one outstanding
    /// async read.
    pub fn placeholder_count(&self) -> usize {
        let g = self.guard();
        g.items.iter().filter(|it| it.is_placeholder()).count()
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        let g = self.guard();
        let mut prev_end = i64::MIN;
        let mut total = 0u64;
        for it in &g.items {
            assert!(it.begin >= prev_end, "overlapping intervals");
            assert!(it.end > it.begin, "empty interval");
            if let Some(d) = &it.data {
                assert_eq!(d.len() as u64, it.len());
                total += it.len();
            }
            prev_end = it.end;
        }
        assert_eq!(total, g.data_bytes);
        assert!(total <= g.capacity.max(1));
    }
}

impl CacheInner {
    /// Removes every interval overlapping `[begin, end)`, keeping the
    /// parts outside the range.
    fn carve(&mut self, begin: i64, end: i64) {
        if end <= begin {
            return;
        }
        let mut idx = self.items.partition_point(|it| it.end <= begin);
        while idx < self.items.len() {
            if self.items[idx].begin >= end {
                break;
            }
            let it = self.items[idx].clone();
            if let Some(d) = &it.data {
                self.data_bytes -= it.len();
                self.items.remove(idx);
                // Left remainder.
                if it.begin < begin {
                    let keep = (begin - it.begin) as usize;
                    self.items.insert(
                        idx,
                        CacheItem {
                            begin: it.begin,
                            end: begin,
                            data: Some(d.slice(..keep)),
                            tick: it.tick,
                            seq: it.seq,
                        },
                    );
                    self.data_bytes += (begin - it.begin) as u64;
                    idx += 1;
                }
                // Right remainder.
                if it.end > end {
                    let skip = (end - it.begin) as usize;
                    self.items.insert(
                        idx,
                        CacheItem {
                            begin: end,
                            end: it.end,
                            data: Some(d.slice(skip..)),
                            tick: it.tick,
                            seq: it.seq,
                        },
                    );
                    self.data_bytes += (it.end - end) as u64;
                    idx += 1;
                }
            } else {
                self.items.remove(idx);
                if it.begin < begin {
                    self.items.insert(
                        idx,
                        CacheItem { end: begin, data: None, ..it.clone() },
                    );
                    idx += 1;
                }
                if it.end > end {
                    self.items.insert(
                        idx,
                        CacheItem { begin: end, data: None, ..it },
                    );
                    idx += 1;
                }
            }
        }
    }

    /// Evicts data intervals until `need` more bytes fit. Placeholders are
    /// never evicted. Returns false when `need` exceeds the capacity.
    fn make_room(&mut self, need: u64) -> bool {
        if need > self.capacity {
            return false;
        }
        while self.data_bytes + need > self.capacity {
            let victim = match self.policy {
                RemovalPolicy::Lru => self
                    .items
                    .iter()
                    .enumerate()
                    .filter(|(_, it)| !it.is_placeholder())
                    .min_by_key(|(_, it)| it.tick)
                    .map(|(i, _)| i),
                RemovalPolicy::Fifo => self
                    .items
                    .iter()
                    .enumerate()
                    .filter(|(_, it)| !it.is_placeholder())
                    .min_by_key(|(_, it)| it.seq)
                    .map(|(i, _)| i),
            };
            match victim {
                Some(i) => {
                    let it = self.items.remove(i);
                    self.data_bytes -= it.len();
                }
                None => return false,
            }
        }
        true
    }
}
