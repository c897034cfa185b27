//! Reusable host scratch buffers
//!
//! Intermediate activations are allocated through the pool so that decode
//! steps of the same shape reuse each other's storage. Buffers are keyed by
//! element count; the pool is cleared at invocation boundaries, never
//! between steps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A pool of reusable f32 buffers, shared by clones.
#[derive(Clone, Default)]
pub struct BufferPool {
    inner: Arc<Mutex<PoolInner>>,
}

#[derive(Default)]
struct PoolInner {
    /// Free buffers indexed by element count. Each entry is a LIFO stack.
    free: HashMap<usize, Vec<Vec<f32>>>,
    free_bytes: usize,
    hits: u64,
    misses: u64,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // The pool holds no invariants a panicking holder could break.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A zeroed buffer of `len` elements, reused when one is cached.
    #[must_use]
    pub fn acquire(&self, len: usize) -> Vec<f32> {
        let mut pool = self.lock();
        let cached = pool.free.get_mut(&len).and_then(Vec::pop);
        if let Some(mut buf) = cached {
            pool.free_bytes -= len * std::mem::size_of::<f32>();
            pool.hits += 1;
            buf.fill(0.0);
            return buf;
        }
        pool.misses += 1;
        vec![0.0; len]
    }

    /// Return a buffer for future reuse.
    pub fn release(&self, buf: Vec<f32>) {
        if buf.is_empty() {
            return;
        }
        let mut pool = self.lock();
        pool.free_bytes += buf.len() * std::mem::size_of::<f32>();
        pool.free.entry(buf.len()).or_default().push(buf);
    }

    /// Number of cache hits (buffer reused from pool).
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.lock().hits
    }

    /// Number of cache misses (fresh allocation required).
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.lock().misses
    }

    /// Total bytes currently held (free) in the pool.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.lock().free_bytes
    }

    /// Drop every cached buffer.
    pub fn clear(&self) {
        let mut pool = self.lock();
        pool.free.clear();
        pool.free_bytes = 0;
    }
}
