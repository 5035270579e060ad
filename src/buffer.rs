//! Byte buffers handed between sockets and callbacks.
//!
//! [`Buffer`] is a length-bounded byte sequence. Cloning one always yields an
//! independent copy of the filled bytes, so a clone may be handed to a data
//! callback that keeps it around long after the receive loop has reused the
//! original storage.
//!
//! [`BufferPool`] recycles receive scratch buffers so that a busy worker does
//! not allocate on every readable event.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Default size of receive buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// A byte sequence that never grows past its limit.
#[derive(PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    limit: usize,
}

impl Buffer {
    /// Creates an empty buffer that can hold up to `limit` bytes.
    pub fn with_capacity(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Like [`with_capacity`](Self::with_capacity) but allocates on demand.
    pub fn bounded(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    /// Creates a buffer holding a copy of `bytes`. The limit is the slice length.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            limit: bytes.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of bytes this buffer will hold.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Appends as much of `bytes` as fits and returns how many were taken.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Drops the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    /// Lets `fill` write into the unused tail and keeps the bytes it reports.
    ///
    /// The closure receives a zeroed slice of exactly [`remaining`](Self::remaining)
    /// bytes. Whatever it returns in `Ok(n)` is clamped to that length.
    pub fn fill_with<E, F>(&mut self, fill: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        let start = self.data.len();
        self.data.resize(self.limit, 0);
        match fill(&mut self.data[start..]) {
            Ok(n) => {
                let n = n.min(self.limit - start);
                self.data.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(start);
                Err(e)
            }
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl Clone for Buffer {
    /// Copies only the filled bytes. The copy shares nothing with `self`.
    fn clone(&self) -> Self {
        let mut data = Vec::with_capacity(self.data.len());
        data.extend_from_slice(&self.data);
        Self {
            data,
            limit: self.limit,
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        let limit = data.len();
        Self { data, limit }
    }
}

/// A thread-safe pool of receive buffers.
///
/// Buffers are created lazily when the pool is empty and are only kept on
/// return while the pool holds fewer than its initial size.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<VecDeque<Buffer>>>,
    buffer_size: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(initial_size: usize, buffer_size: usize) -> Self {
        let pool = (0..initial_size)
            .map(|_| Buffer::with_capacity(buffer_size))
            .collect::<VecDeque<_>>();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            buffer_size,
            capacity: initial_size,
        }
    }

    /// Takes an empty buffer out of the pool, allocating one if none is free.
    #[inline]
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .pool
            .lock()
            .pop_front()
            .unwrap_or_else(|| Buffer::with_capacity(self.buffer_size));

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Number of idle buffers currently held.
    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned, cleared, on drop.
pub struct PooledBuffer {
    buffer: Option<Buffer>,
    pool: Arc<Mutex<VecDeque<Buffer>>>,
    capacity: usize,
}

impl Deref for PooledBuffer {
    type Target = Buffer;

    #[inline]
    fn deref(&self) -> &Buffer {
        // Only emptied by Drop.
        match self.buffer.as_ref() {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer used after drop"),
        }
    }
}

impl DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Buffer {
        match self.buffer.as_mut() {
            Some(buffer) => buffer,
            None => unreachable!("pooled buffer used after drop"),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            let mut pool = self.pool.lock();
            if pool.len() < self.capacity {
                buffer.clear();
                pool.push_back(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_respects_limit() {
        let mut buffer = Buffer::with_capacity(4);
        assert_eq!(buffer.append(b"abcdef"), 4);
        assert_eq!(buffer.as_slice(), b"abcd");
        assert_eq!(buffer.remaining(), 0);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = Buffer::from_slice(b"hello");
        let mut copy = original.clone();

        copy.as_mut_slice()[0] = b'j';
        original.clear();

        assert_eq!(copy.as_slice(), b"jello");
        assert!(original.is_empty());
    }

    #[test]
    fn test_fill_with_keeps_reported_bytes() {
        let mut buffer = Buffer::with_capacity(16);
        let n = buffer
            .fill_with(|tail| {
                tail[..3].copy_from_slice(b"abc");
                Ok::<_, ()>(3)
            })
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(buffer.as_slice(), b"abc");
    }

    #[test]
    fn test_fill_with_error_leaves_buffer_untouched() {
        let mut buffer = Buffer::from(b"xy".to_vec());
        let result = buffer.fill_with(|_| Err::<usize, _>("boom"));
        assert!(result.is_err());
        assert_eq!(buffer.as_slice(), b"xy");
    }

    #[test]
    fn test_consume_front() {
        let mut buffer = Buffer::from_slice(b"abcdef");
        buffer.consume(2);
        assert_eq!(buffer.as_slice(), b"cdef");
        buffer.consume(10);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pool_reuse() {
        let pool = BufferPool::new(1, 1024);

        let mut first = pool.acquire();
        first.append(b"stale");
        drop(first);
        assert_eq!(pool.available(), 1);

        let second = pool.acquire();
        assert!(second.is_empty(), "returned buffers are cleared");
        assert_eq!(second.limit(), 1024);
    }

    #[test]
    fn test_pool_capacity_limit() {
        let pool = BufferPool::new(2, 64);

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.available(), 0);

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.available(), 2, "pool should respect capacity limit");
    }
}
