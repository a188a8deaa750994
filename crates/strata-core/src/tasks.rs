//! Background task execution.
//!
//! The pool owns a fixed set of worker threads that drive a shared
//! `async-executor`. Work spawned here must not touch state owned by the
//! caller's thread; results come back through the returned [`Task`].

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_executor::Executor;

pub use async_executor::Task;
pub use futures_lite::future::block_on;

/// How long an idle worker sleeps before polling the executor again.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// A fixed-size pool of worker threads executing spawned futures.
///
/// # Example
///
/// ```ignore
/// let pool = TaskPool::new(4);
/// let task = pool.spawn(async { 6 * 7 });
/// assert_eq!(strata_core::tasks::block_on(task), 42);
/// ```
pub struct TaskPool {
    executor: Arc<Executor<'static>>,
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TaskPool {
    /// # Panics
    ///
    /// Panics if `num_threads` is 0 or a worker thread cannot be spawned.
    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0, "TaskPool must have at least one thread");

        let executor = Arc::new(Executor::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let threads = (0..num_threads)
            .map(|i| {
                let exec = executor.clone();
                let shutdown = shutdown.clone();
                thread::Builder::new()
                    .name(format!("strata-worker-{}", i))
                    .spawn(move || {
                        while !shutdown.load(Ordering::Acquire) {
                            if !exec.try_tick() {
                                thread::sleep(IDLE_BACKOFF);
                            }
                        }
                    })
                    .expect("failed to spawn task pool thread")
            })
            .collect::<Vec<_>>();

        tracing::debug!("TaskPool created with {} threads", num_threads);

        Self {
            executor,
            threads,
            shutdown,
        }
    }

    /// One worker per core, minus one for the owning thread.
    pub fn default_threads() -> Self {
        Self::new(num_cpus::get().saturating_sub(1).max(1))
    }

    pub fn spawn<T>(&self, future: impl Future<Output = T> + Send + 'static) -> Task<T>
    where
        T: Send + 'static,
    {
        self.executor.spawn(future)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Stop the workers and wait for them to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }

        tracing::debug!("Shutting down TaskPool with {} threads", self.threads.len());
        self.shutdown.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!("Task pool thread panicked: {:?}", e);
            }
        }
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::default_threads()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_pool_creation() {
        let pool = TaskPool::new(2);
        assert_eq!(pool.thread_count(), 2);
    }

    #[test]
    fn test_spawn_and_await() {
        let pool = TaskPool::new(2);
        let task = pool.spawn(async { 42 });
        assert_eq!(block_on(task), 42);
    }

    #[test]
    fn test_task_reports_finished() {
        let pool = TaskPool::new(1);
        let task = pool.spawn(async { "done" });
        while !task.is_finished() {
            thread::sleep(IDLE_BACKOFF);
        }
        assert_eq!(block_on(task), "done");
    }

    #[test]
    fn test_multiple_tasks_keep_order() {
        let pool = TaskPool::new(4);
        let tasks: Vec<_> = (0..10).map(|i| pool.spawn(async move { i * 2 })).collect();
        let results: Vec<_> = tasks.into_iter().map(block_on).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }

    #[test]
    fn test_default_threads() {
        let pool = TaskPool::default_threads();
        assert!(pool.thread_count() >= 1);
        assert!(pool.thread_count() <= num_cpus::get().max(1));
    }

    #[test]
    #[should_panic(expected = "TaskPool must have at least one thread")]
    fn test_zero_threads_panics() {
        TaskPool::new(0);
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let pool = TaskPool::new(2);
        let task = pool.spawn(async { 1 });
        assert_eq!(block_on(task), 1);
        pool.shutdown();
    }
}
