// Reusable byte buffers for staging whole chunks in memory.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// Process-wide pool of growable buffers. Buffers come back automatically
/// when the last `Bytes` handle produced by [`PooledBuf::freeze`] drops, so
/// a buffer is never reused while a response still references it.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    leased: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            leased: AtomicUsize::new(0),
        }
    }

    /// Take an empty buffer, reusing a previous allocation when one is free.
    pub fn get(self: &Arc<Self>) -> PooledBuf {
        let data = self.free.lock().pop().unwrap_or_default();
        self.leased.fetch_add(1, Ordering::SeqCst);
        PooledBuf {
            data,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, mut data: Vec<u8>) {
        data.clear();
        self.leased.fetch_sub(1, Ordering::SeqCst);
        self.free.lock().push(data);
    }

    /// Buffers currently checked out and not yet returned.
    pub fn leased(&self) -> usize {
        self.leased.load(Ordering::SeqCst)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer on loan from the pool. Returns itself on drop.
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Expose the contents as `Bytes` without copying. The allocation goes
    /// back to the pool once every clone of the returned handle is gone.
    pub fn freeze(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = mem::take(&mut self.data);
        self.pool.put(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = Arc::new(BufferPool::new());

        let mut buf = pool.get();
        buf.extend_from_slice(b"some payload");
        let capacity_hint = buf.len();
        drop(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.data.capacity() >= capacity_hint);
    }

    #[test]
    fn leased_tracks_outstanding_buffers() {
        let pool = Arc::new(BufferPool::new());
        assert_eq!(pool.leased(), 0);

        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.leased(), 2);

        drop(a);
        assert_eq!(pool.leased(), 1);
        drop(b);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn freeze_returns_buffer_after_last_reader() {
        let pool = Arc::new(BufferPool::new());

        let mut buf = pool.get();
        buf.extend_from_slice(b"chunk bytes");
        let bytes = buf.freeze();
        let copy = bytes.clone();
        assert_eq!(pool.leased(), 1);

        drop(bytes);
        assert_eq!(pool.leased(), 1);
        assert_eq!(&copy[..], b"chunk bytes");

        drop(copy);
        assert_eq!(pool.leased(), 0);
    }
}
