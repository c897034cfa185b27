//! Per-rank execution context
//!
//! Bundles what a CUDA-style backend keeps in ambient global state: the
//! device ordinal, the ordered execution stream (here a dedicated rayon
//! pool), the GEMM algorithm cache with the mutex that serializes its use,
//! and the scratch buffer pool. Components receive it by `Arc` at
//! construction.

use std::sync::{Arc, Mutex, MutexGuard};

use rayon::{ThreadPool, ThreadPoolBuilder};
use tessera::{Error, Result};

use crate::matmul::AlgorithmMap;
use crate::pool::BufferPool;

pub struct ExecutionContext {
    ordinal: usize,
    pool: ThreadPool,
    gemm: Mutex<AlgorithmMap>,
    buffers: BufferPool,
}

impl ExecutionContext {
    /// Create a context for `ordinal` backed by `num_threads` workers.
    ///
    /// # Errors
    /// Returns `DeviceExecution` if the worker pool cannot be started.
    pub fn new(ordinal: usize, num_threads: usize) -> Result<Arc<Self>> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(move |i| format!("tessera-dev{ordinal}-{i}"))
            .build()
            .map_err(|e| Error::DeviceExecution(format!("thread pool: {e}")))?;
        Ok(Arc::new(Self {
            ordinal,
            pool,
            gemm: Mutex::new(AlgorithmMap::default()),
            buffers: BufferPool::new(),
        }))
    }

    /// Context for a rank when `local_ranks` ranks share `device_count`
    /// devices: ordinal `rank % device_count`, and the host's cores split
    /// evenly between local ranks.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if `device_count` is zero, or a pool error.
    pub fn for_rank(global_rank: usize, device_count: usize, local_ranks: usize) -> Result<Arc<Self>> {
        if device_count == 0 {
            return Err(Error::InvalidConfig("device_count must be positive".into()));
        }
        let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let threads = (cores / local_ranks.max(1)).max(1);
        Self::new(global_rank % device_count, threads)
    }

    #[must_use]
    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` on this context's stream. Parallel iterators inside `op`
    /// use this rank's workers only.
    pub fn install<R, F>(&self, op: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    /// Lock the GEMM handle. Held for the duration of one matmul.
    ///
    /// # Errors
    /// Returns `DeviceExecution` if a previous holder panicked.
    pub fn lock_gemm(&self) -> Result<MutexGuard<'_, AlgorithmMap>> {
        self.gemm
            .lock()
            .map_err(|_| Error::DeviceExecution("GEMM handle mutex poisoned".into()))
    }

    #[must_use]
    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Wait for outstanding work. Work on the host stream completes before
    /// `install` returns, so this only checks the handle is still usable.
    ///
    /// # Errors
    /// Returns `DeviceExecution` if the GEMM handle is poisoned.
    pub fn synchronize(&self) -> Result<()> {
        self.lock_gemm().map(drop)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("ordinal", &self.ordinal)
            .field("num_threads", &self.num_threads())
            .finish_non_exhaustive()
    }
}
