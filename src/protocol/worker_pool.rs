//! Bounded task pool for inbound message handling.
//!
//! Submission never waits: when every slot is busy the task is handed back
//! as [`PoolError::Saturated`] and the caller drops it.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Semaphore, TryAcquireError};
use tracing::debug;

use crate::error::PoolError;

#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently running a task
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Spawns `task` if a slot is free.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(PoolError::Saturated),
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
        };
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
        Ok(())
    }

    /// Rejects further submissions; running tasks finish normally.
    pub fn close(&self) {
        debug!("Closing worker pool");
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_saturated_pool_rejects() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();

        pool.submit(async move {
            let _ = release_rx.await;
            let _ = done_tx.send(());
        })
        .unwrap();
        assert_eq!(pool.submit(async {}), Err(PoolError::Saturated));

        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
        // the permit is released right after the task body completes
        tokio::task::yield_now().await;
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = WorkerPool::new(4);
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.submit(async {}), Err(PoolError::Closed));
    }

    #[test]
    fn test_zero_size_gets_one_slot() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
