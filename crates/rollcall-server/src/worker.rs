//! Bounded executor for registry work submitted from host framework threads.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Spawns futures on a runtime with at most `concurrency` of them running.
///
/// Dropping the returned handle detaches the task; it still runs to completion.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    runtime: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(runtime: Handle, concurrency: usize) -> Self {
        Self {
            runtime,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Pool on the runtime of the calling task.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn on_current_runtime(concurrency: usize) -> Self {
        Self::new(Handle::current(), concurrency)
    }

    /// Safe to call from threads that are not part of the runtime.
    pub fn submit<F, T>(&self, work: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.runtime.spawn(async move {
            // The semaphore is never closed, so this only waits.
            let _permit = permits.acquire_owned().await.ok();
            work.await
        })
    }
}
