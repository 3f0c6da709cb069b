//! This module provides the task primitives chunk workers are scheduled with.

use std::future::Future;
use std::sync::Arc;

use futures::future::{self, AbortHandle};
use tokio::sync::Semaphore;
use tracing::Instrument;

/// A counting pool of admission tokens, bounding the number of transfer attempts in flight.
///
/// Unlike a plain semaphore permit, a token taken by [`Tokens::acquire()`] is never given back on its own: it has to be
/// explicitly returned with [`Tokens::release()`]. The pool is created full and never holds more than its initial
/// capacity.
///
/// # Example
/// ```
/// # tokio_test::block_on(async {
/// # use multifetch::task::Tokens;
/// let tokens = Tokens::new(2);
///
/// tokens.acquire().await;
/// tokens.acquire().await;
/// assert_eq!(tokens.available(), 0);
///
/// tokens.release();
/// assert_eq!(tokens.available(), 1);
/// # })
/// ```
#[derive(Debug, Clone)]
pub struct Tokens {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Tokens {
    /// Create a full pool of `capacity` tokens.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take one token, waiting until one is available.
    ///
    /// The pool is never closed, so waiting can only end with a token.
    pub async fn acquire(&self) {
        if let Ok(permit) = self.semaphore.acquire().await {
            permit.forget();
        }
    }

    /// Return one token to the pool.
    ///
    /// Returning a token to a full pool is a no-op.
    pub fn release(&self) {
        if self.semaphore.available_permits() < self.capacity {
            self.semaphore.add_permits(1);
        }
    }

    /// Number of tokens currently available.
    #[inline]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// A set of background tasks, all aborted at once when the set is dropped.
///
/// Chunk workers are never awaited: they report through channels instead. Holding them in a `WorkerSet` ties their
/// lifetime to the download session, so that an aborted session does not leave transfers running behind.
#[derive(Debug, Default)]
pub struct WorkerSet {
    handles: Vec<AbortHandle>,
}

impl WorkerSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            handles: Vec::with_capacity(capacity),
        }
    }

    /// Spawn `future` in the background, within the current span.
    pub fn spawn(&mut self, future: impl Future<Output = ()> + Send + 'static) {
        let (abortable, abort_handle) = future::abortable(future.in_current_span());

        tokio::spawn(abortable);

        self.handles.push(abort_handle);
    }

    /// Number of spawned tasks not aborted yet, including those which already completed.
    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        self.handles.iter().filter(|handle| !handle.is_aborted()).count()
    }

    /// Abort every spawned task.
    pub fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            tracing::debug!("Aborting {} workers...", self.handles.len());
        }

        self.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_tokens_never_overflow() {
        let tokens = Tokens::new(2);

        tokens.release();
        assert_eq!(tokens.available(), 2);

        tokens.acquire().await;
        tokens.release();
        tokens.release();
        assert_eq!(tokens.available(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tokens_wait_for_release() {
        let tokens = Tokens::new(1);
        tokens.acquire().await;

        let waiter = tokio::spawn({
            let tokens = tokens.clone();
            async move { tokens.acquire().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tokens.release();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(tokens.available(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_set_aborts_on_drop() {
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel::<()>();

        let mut workers = WorkerSet::with_capacity(1);
        workers.spawn(async move {
            let _sender = sender;
            future::pending::<()>().await
        });
        assert_eq!(workers.running(), 1);

        drop(workers);

        // the channel closes once the aborted task has dropped its sender
        let closed = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await.unwrap();
        assert_eq!(closed, None);
    }
}
