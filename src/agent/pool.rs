//! Bounded worker slots
//!
//! Caps concurrent outbound sends independent of batch size.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

/// A held slot; dropping it frees the slot
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    /// A pool of `size` slots, at least one
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Wait for a free slot, `None` once the pool is closed
    pub async fn acquire(&self) -> Option<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore).acquire_owned().await.ok()?;
        debug!(
            "Acquired worker slot, {} of {} in use",
            self.size() - self.available(),
            self.size()
        );
        Some(WorkerSlot { _permit: permit })
    }

    pub fn release(&self, slot: WorkerSlot) {
        drop(slot);
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wake waiters with `None` and refuse further acquires
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}
