//! An async counting semaphore with RAII guards, used to cap concurrent
//! preloads, flushes and replication fan-out.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// A counting semaphore whose permits are released on guard drop.
#[derive(Debug)]
pub struct AsyncSemaphore {
    inner: Arc<Semaphore>,
    capacity: usize,
}

impl AsyncSemaphore {
    /// Create a semaphore with `capacity` permits.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Semaphore::new(capacity)),
            capacity,
        })
    }

    /// The configured number of permits.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    /// Acquire a permit without waiting, if one is free.
    pub fn try_acquire(&self) -> Option<SemaphoreGuard> {
        match Arc::clone(&self.inner).try_acquire_owned() {
            Ok(permit) => Some(SemaphoreGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => None,
            Err(TryAcquireError::Closed) => None,
        }
    }

    /// Wait until a permit is free.
    pub async fn acquire(&self) -> SemaphoreGuard {
        let permit = Arc::clone(&self.inner)
            .acquire_owned()
            .await
            .expect("semaphore closed");
        SemaphoreGuard { _permit: permit }
    }
}

/// Holds one permit of an [`AsyncSemaphore`].
#[derive(Debug)]
pub struct SemaphoreGuard {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_respects_capacity() {
        let semaphore = AsyncSemaphore::new(2);

        let a = semaphore.try_acquire().unwrap();
        let _b = semaphore.try_acquire().unwrap();
        assert!(semaphore.try_acquire().is_none());

        drop(a);
        assert!(semaphore.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let semaphore = AsyncSemaphore::new(1);
        let guard = semaphore.try_acquire().unwrap();

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _guard = semaphore.acquire().await;
            })
        };

        // The waiter cannot finish while the permit is held.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }
}
