//! Per-device memory pools (§5): a fixed preallocated low-water reserve,
//! interruptible acquisition, block-rather-than-fail under exhaustion.

use std::sync::Mutex;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool acquisition cancelled")]
    Cancelled,
}

/// A pool of reusable `T`s sized by a semaphore. Acquiring past the
/// preallocated reserve blocks; it never fails except via cancellation.
pub struct Pool<T> {
    semaphore: Semaphore,
    free: Mutex<Vec<T>>,
}

pub struct PooledGuard<'a, T> {
    pool: &'a Pool<T>,
    item: Option<T>,
    _permit: tokio::sync::SemaphorePermit<'a>,
}

impl<T> std::ops::Deref for PooledGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for PooledGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap()
    }
}

impl<T> Drop for PooledGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.free.lock().unwrap().push(item);
        }
    }
}

impl<T> Pool<T> {
    /// `reserve` preallocated items, built by `make`, form the low-water
    /// mark below which acquisition never blocks.
    pub fn new(reserve: usize, make: impl Fn() -> T) -> Self {
        Self {
            semaphore: Semaphore::new(reserve),
            free: Mutex::new((0..reserve).map(|_| make()).collect()),
        }
    }

    /// Acquires one item, racing against `cancel` at the only suspension
    /// point (§9 "signals for cancellation" replaced with a polled token).
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        make: impl Fn() -> T,
    ) -> Result<PooledGuard<'_, T>, PoolError> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            permit = self.semaphore.acquire() => permit.expect("pool semaphore never closed"),
        };
        let item = self.free.lock().unwrap().pop().unwrap_or_else(make);
        Ok(PooledGuard {
            pool: self,
            item: Some(item),
            _permit: permit,
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_reuses_freed_items() {
        let pool: Pool<Vec<u8>> = Pool::new(1, Vec::new);
        let cancel = CancellationToken::new();
        {
            let mut guard = pool.acquire(&cancel, Vec::new).await.unwrap();
            guard.push(1);
        }
        let guard = pool.acquire(&cancel, Vec::new).await.unwrap();
        assert_eq!(&*guard, &vec![1]);
    }

    #[tokio::test]
    async fn acquire_is_cancellable() {
        let pool: Pool<()> = Pool::new(0, || ());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = pool.acquire(&cancel, || ()).await;
        assert!(matches!(result, Err(PoolError::Cancelled)));
    }
}
