// log-enricher - pool.rs
//
// 4.A Byte-buffer & entry pools: bounded reuse of line buffers and entry
// structs, with every bound named in util::constants.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::LogEntry;
use crate::util::constants::{
    BYTE_POOL_MAX_BUFFER_SIZE, BYTE_POOL_SIZE, ENTRY_FIELD_BUCKETS, ENTRY_POOL_SIZE,
};

/// Bounded pool of reusable [`LogEntry`] values.
///
/// Acquiring blocks (asynchronously) when the pool is both empty and at
/// its hard cap; releasing clears the entry and wakes one waiter.
pub struct EntryPool {
    inner: Mutex<EntryPoolInner>,
    notify: Notify,
    capacity: usize,
}

struct EntryPoolInner {
    free: Vec<Box<LogEntry>>,
    /// Count of entries currently checked out, so total (free + in-flight)
    /// never exceeds `capacity`.
    in_flight: usize,
    /// Count of releases landing in each size bucket, used to pick the
    /// pre-sized capacity for the next reused entry's cleared map.
    bucket_counts: Vec<u64>,
}

impl EntryPool {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(ENTRY_POOL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(EntryPool {
            inner: Mutex::new(EntryPoolInner {
                free: Vec::new(),
                in_flight: 0,
                bucket_counts: vec![0; ENTRY_FIELD_BUCKETS.len()],
            }),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Acquire an entry, blocking asynchronously if the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>) -> PooledEntry {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(entry) = inner.free.pop() {
                    inner.in_flight += 1;
                    return PooledEntry {
                        entry: Some(entry),
                        pool: Arc::clone(self),
                    };
                }
                if inner.in_flight < self.capacity {
                    inner.in_flight += 1;
                    let target_capacity = Self::target_capacity(&inner.bucket_counts);
                    drop(inner);
                    let mut entry = Box::new(LogEntry::new_empty());
                    entry.fields.reserve(target_capacity);
                    return PooledEntry {
                        entry: Some(entry),
                        pool: Arc::clone(self),
                    };
                }
            }
            self.notify.notified().await;
        }
    }

    fn bucket_for(len: usize) -> usize {
        ENTRY_FIELD_BUCKETS
            .iter()
            .position(|&b| len <= b)
            .unwrap_or(ENTRY_FIELD_BUCKETS.len() - 1)
    }

    fn target_capacity(bucket_counts: &[u64]) -> usize {
        let (largest_idx, _) = bucket_counts
            .iter()
            .enumerate()
            .max_by_key(|(_, count)| **count)
            .unwrap_or((0, &0));
        ENTRY_FIELD_BUCKETS[largest_idx]
    }

    fn release(&self, mut entry: Box<LogEntry>) {
        let observed_bucket = Self::bucket_for(entry.fields.len());
        entry.reset_for_reuse();

        let mut inner = self.inner.lock();
        inner.bucket_counts[observed_bucket] += 1;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.free.push(entry);
        drop(inner);
        self.notify.notify_one();
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }
}

/// RAII handle returned by [`EntryPool::acquire`]. Dropping it (on every
/// exit path, including errors) returns the entry to the pool.
pub struct PooledEntry {
    entry: Option<Box<LogEntry>>,
    pool: Arc<EntryPool>,
}

impl std::ops::Deref for PooledEntry {
    type Target = LogEntry;
    fn deref(&self) -> &LogEntry {
        self.entry.as_ref().expect("entry taken before drop")
    }
}

impl std::ops::DerefMut for PooledEntry {
    fn deref_mut(&mut self) -> &mut LogEntry {
        self.entry.as_mut().expect("entry taken before drop")
    }
}

impl Drop for PooledEntry {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry);
        }
    }
}

/// Bounded pool of growable byte buffers. Buffers
/// larger than `BYTE_POOL_MAX_BUFFER_SIZE` on release are dropped instead
/// of returned, to prevent memory retention from one oversized line.
pub struct BytePool {
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
}

impl BytePool {
    pub fn new() -> Arc<Self> {
        Arc::new(BytePool {
            free: Mutex::new(Vec::new()),
            capacity: BYTE_POOL_SIZE,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.free.lock().pop().unwrap_or_default();
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut buf: BytesMut) {
        if buf.capacity() > BYTE_POOL_MAX_BUFFER_SIZE {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BytePool>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_release_round_trip() {
        let pool = EntryPool::with_capacity(2);
        let mut a = pool.acquire().await;
        a.line = "one".to_string();
        assert_eq!(pool.in_flight(), 1);
        drop(a);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_capacity() {
        let pool = EntryPool::with_capacity(1);
        let _a = pool.acquire().await;
        assert_eq!(pool.in_flight(), 1);

        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            let _b = pool2.acquire().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pool.in_flight(), 1, "second acquire must block, not exceed capacity");

        drop(_a);
        waiter.await.unwrap();
    }

    #[test]
    fn byte_pool_drops_oversized_buffers() {
        let pool = BytePool::new();
        {
            let mut buf = pool.acquire();
            buf.reserve(BYTE_POOL_MAX_BUFFER_SIZE + 1024);
            buf.extend_from_slice(&vec![0u8; BYTE_POOL_MAX_BUFFER_SIZE + 1024]);
        }
        assert!(pool.free.lock().is_empty());
    }
}
