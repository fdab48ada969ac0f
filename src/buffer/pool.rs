//! Power-of-two aligned byte pool backing port allocations.
//!
//! Sizes are rounded up to the next power of two (minimum 1 024 bytes) and
//! kept in per-size buckets so a port freed for reconfiguration can hand its
//! storage straight to the reallocated port.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::constants::{MAX_BUCKET_ENTRIES, MAX_POOL_BYTES, MAX_POOL_REGION, MIN_POOL_REGION};

struct PoolInner {
    buckets: HashMap<usize, Vec<Vec<u8>>>,
    total_bytes: usize,
}

impl PoolInner {
    fn aligned_size(size: usize) -> usize {
        size.max(MIN_POOL_REGION).next_power_of_two()
    }

    fn acquire(&mut self, size: usize) -> Vec<u8> {
        let aligned = Self::aligned_size(size);

        if let Some(bucket) = self.buckets.get_mut(&aligned) {
            if let Some(mut buf) = bucket.pop() {
                self.total_bytes -= aligned;
                buf.clear();
                return buf;
            }
        }
        Vec::with_capacity(aligned)
    }

    fn release(&mut self, mut buf: Vec<u8>) {
        let size = buf.capacity();

        if !(MIN_POOL_REGION..=MAX_POOL_REGION).contains(&size) || !size.is_power_of_two() {
            return;
        }
        if self.total_bytes + size > MAX_POOL_BYTES {
            return;
        }

        let bucket = self.buckets.entry(size).or_default();
        if bucket.len() >= MAX_BUCKET_ENTRIES {
            return;
        }

        buf.clear();
        self.total_bytes += size;
        bucket.push(buf);
    }
}

/// Thread-safe byte pool. One per adapter; never global.
pub struct BytePool {
    inner: Mutex<PoolInner>,
}

impl BytePool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                buckets: HashMap::new(),
                total_bytes: 0,
            }),
        }
    }

    /// Acquire storage for at least `size` bytes.
    pub fn acquire(&self, size: usize) -> Vec<u8> {
        self.inner.lock().acquire(size)
    }

    /// Return storage for reuse.
    pub fn release(&self, buf: Vec<u8>) {
        self.inner.lock().release(buf);
    }

    pub fn clear(&self) {
        let mut g = self.inner.lock();
        g.buckets.clear();
        g.total_bytes = 0;
    }

    pub fn stats(&self) -> PoolStats {
        let g = self.inner.lock();
        PoolStats {
            total_bytes: g.total_bytes,
            buckets: g.buckets.len(),
            entries: g.buckets.values().map(|b| b.len()).sum(),
        }
    }
}

impl Default for BytePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of pool health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_bytes: usize,
    pub buckets: usize,
    pub entries: usize,
}
