use super::types::JobError;
use crate::config::ConfigError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Bounded pool of blocking worker threads for CPU-bound jobs
#[derive(Clone)]
pub struct WorkerPool {
    /// Semaphore to limit concurrent jobs
    semaphore: Arc<Semaphore>,
    size: usize,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        info!(workers = size, "Worker pool created");
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `work` on a blocking thread once a worker slot is free.
    /// The calling task suspends; the runtime keeps serving other tasks.
    pub async fn execute<F, T>(&self, work: F) -> Result<T, JobError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        // Permit is released when _permit goes out of scope
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JobError::PoolClosed)?;
        debug!(available = self.semaphore.available_permits(), "Worker slot acquired");

        match tokio::task::spawn_blocking(work).await {
            Ok(output) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                Ok(output)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(JobError::Worker(e))
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.size,
            available_slots: self.semaphore.available_permits(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub available_slots: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Owner of the one process-wide [`WorkerPool`]
#[derive(Default)]
pub struct PoolRegistry {
    pool: Mutex<Option<WorkerPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pool. Fails if it already exists.
    pub fn initialize(&self, size: usize) -> Result<WorkerPool, ConfigError> {
        let mut slot = self.pool.lock();
        if slot.is_some() {
            return Err(ConfigError::PoolAlreadyInitialized);
        }
        let pool = WorkerPool::new(size);
        *slot = Some(pool.clone());
        Ok(pool)
    }

    pub fn get(&self) -> Option<WorkerPool> {
        self.pool.lock().clone()
    }
}
