use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded, non-blocking submission of short-lived work, gated by a
/// `tokio::sync::Semaphore`. Never blocks on `acquire`: a full pool reports
/// back to the caller so the enqueue path can persist the row as
/// `Initialized` instead.
pub(crate) struct Pool {
    semaphore: Arc<Semaphore>,
}

impl Pool {
    pub(crate) fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// Attempts a non-blocking acquisition. `None` means the pool is full;
    /// the caller then falls back to a bare `tokio::spawn`.
    pub(crate) fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }
}
