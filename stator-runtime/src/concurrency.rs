//! Worker budget for concurrent transition executions

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of executions in flight in one process.
///
/// Permits are owned so they can travel with a detached execution task and
/// are returned when that task finishes. The scheduler never waits for a
/// permit: a cycle only dispatches what fits in the free slots.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Take a slot if one is free right now
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Free slots; the scheduler's per-cycle budget
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Executions currently holding a slot
    pub fn in_use(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permits_are_returned_on_drop() {
        let limiter = ConcurrencyLimiter::new(2);
        assert_eq!(limiter.available(), 2);

        let first = limiter.try_acquire().unwrap();
        let second = limiter.try_acquire().unwrap();
        assert_eq!(limiter.available(), 0);
        assert_eq!(limiter.in_use(), 2);
        assert!(limiter.try_acquire().is_none());

        drop(first);
        assert_eq!(limiter.available(), 1);
        drop(second);
        assert_eq!(limiter.available(), 2);
    }

    #[tokio::test]
    async fn test_permit_travels_with_task() {
        let limiter = ConcurrencyLimiter::new(1);
        let permit = limiter.try_acquire().unwrap();

        let handle = tokio::spawn(async move {
            let _permit = permit;
        });
        handle.await.unwrap();
        assert_eq!(limiter.available(), 1);
    }
}
