//! Leasable typed buffers.
//!
//! `BufferManager` is the interface every other component consumes to get a
//! scratch byte buffer without allocating fresh on every call. A `Lease`
//! returns its buffer to the pool on `Drop`, so a caller returning its lease
//! on every exit path (success, error, cancellation) is enforced by the
//! borrow checker rather than by convention — see DESIGN.md's Open
//! Question #1.

use std::sync::Mutex;

/// A pool that can lease out byte buffers and take them back.
pub trait BufferManager: Send + Sync {
    /// Returns a buffer of at least `min_len` bytes, zero-filled.
    fn rent(&self, min_len: usize) -> Lease<'_>;

    #[doc(hidden)]
    fn return_buffer(&self, buffer: Vec<u8>);
}

/// An RAII handle around a leased buffer. Dereferences to `[u8]`; returns the
/// buffer to its owning pool when dropped.
pub struct Lease<'a> {
    buffer: Option<Vec<u8>>,
    pool: &'a dyn BufferManager,
}

impl<'a> Lease<'a> {
    fn new(buffer: Vec<u8>, pool: &'a dyn BufferManager) -> Self {
        Self {
            buffer: Some(buffer),
            pool,
        }
    }
}

impl std::ops::Deref for Lease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buffer.as_deref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().expect("buffer taken before drop")
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.return_buffer(buffer);
        }
    }
}

/// Rounds `n` up to the next power of two, used as the pool's size class.
fn size_class(n: usize) -> usize {
    n.max(64).next_power_of_two()
}

/// Pools buffers by power-of-two size class behind a mutex-guarded set of
/// free lists. Suitable for the single-writer / multi-reader usage pattern
/// this crate has throughout.
#[derive(Default)]
pub struct PooledBufferManager {
    free_lists: Mutex<Vec<(usize, Vec<Vec<u8>>)>>,
}

impl PooledBufferManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BufferManager for PooledBufferManager {
    fn rent(&self, min_len: usize) -> Lease<'_> {
        let class = size_class(min_len);
        let mut free_lists = self.free_lists.lock().unwrap_or_else(|e| e.into_inner());
        let mut buffer = free_lists
            .iter_mut()
            .find(|(c, _)| *c == class)
            .and_then(|(_, list)| list.pop())
            .unwrap_or_else(|| vec![0; class]);
        buffer.iter_mut().for_each(|b| *b = 0);
        drop(free_lists);
        Lease::new(buffer, self)
    }

    fn return_buffer(&self, buffer: Vec<u8>) {
        let class = size_class(buffer.len());
        let mut free_lists = self.free_lists.lock().unwrap_or_else(|e| e.into_inner());
        match free_lists.iter_mut().find(|(c, _)| *c == class) {
            Some((_, list)) => list.push(buffer),
            None => free_lists.push((class, vec![buffer])),
        }
    }
}

/// Test-only pool that counts outstanding leases, for leak-detection tests.
#[cfg(test)]
#[derive(Default)]
pub struct TrackingBufferManager {
    inner: PooledBufferManager,
    outstanding: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl TrackingBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl BufferManager for TrackingBufferManager {
    fn rent(&self, min_len: usize) -> Lease<'_> {
        self.outstanding
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let class = size_class(min_len);
        let buffer = vec![0; class];
        Lease::new(buffer, self)
    }

    fn return_buffer(&self, buffer: Vec<u8>) {
        self.outstanding
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.return_buffer(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_returns_zeroed_buffer_of_requested_size() {
        let pool = PooledBufferManager::new();
        let lease = pool.rent(10);
        assert!(lease.len() >= 10);
        assert!(lease.iter().all(|&b| b == 0));
    }

    #[test]
    fn lease_is_reused_after_drop() {
        let pool = PooledBufferManager::new();
        {
            let mut lease = pool.rent(100);
            lease[0] = 42;
        }
        let lease = pool.rent(100);
        assert_eq!(lease[0], 0, "returned buffer must be cleared before reuse");
    }

    #[test]
    fn tracking_pool_counts_outstanding_leases() {
        let pool = TrackingBufferManager::new();
        assert_eq!(pool.outstanding(), 0);
        let lease_a = pool.rent(16);
        assert_eq!(pool.outstanding(), 1);
        let lease_b = pool.rent(16);
        assert_eq!(pool.outstanding(), 2);
        drop(lease_a);
        assert_eq!(pool.outstanding(), 1);
        drop(lease_b);
        assert_eq!(pool.outstanding(), 0);
    }
}
