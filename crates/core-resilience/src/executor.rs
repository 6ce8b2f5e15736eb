//! Bounded executor for background recovery work
//!
//! A `TaskExecutor` runs fire-and-forget tasks on a tokio runtime while
//! capping how many of them make progress at once. Tasks that do not get a
//! worker slot wait for one; they never block the caller that scheduled them.
//!
//! Failures returned by a task are logged with the executor and task labels
//! and then dropped. Nothing a background task does can propagate back into
//! the code that scheduled it.
//!
//! Use separate executors for work that may schedule other work, so that a
//! task waiting on a slot can never be waiting on itself.
//!
//! # Example
//!
//! ```
//! use tether_core_resilience::executor::TaskExecutor;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let executor = TaskExecutor::new("reconnect", 4).unwrap();
//!
//! executor.spawn("warmup", async { Ok::<_, std::io::Error>(()) });
//!
//! executor.wait_idle().await;
//! assert_eq!(executor.active_tasks(), 0);
//! # }
//! ```

use super::error::ResilienceError;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

struct ExecutorInner {
    name: String,
    handle: Handle,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    spawned: AtomicU64,
    failed: AtomicU64,
}

/// Named, bounded pool of background tasks
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("name", &self.inner.name)
            .field("max_concurrency", &self.inner.max_concurrency)
            .field("active_tasks", &self.inner.tracker.len())
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl TaskExecutor {
    /// Create an executor on the runtime the caller is running in
    pub fn new(name: impl Into<String>, max_concurrency: usize) -> Result<Self, ResilienceError> {
        let name = name.into();
        let handle = Handle::try_current().map_err(|_| ResilienceError::NoRuntime(name.clone()))?;
        Self::with_handle(name, max_concurrency, handle)
    }

    /// Create an executor that spawns onto an explicit runtime handle
    pub fn with_handle(
        name: impl Into<String>,
        max_concurrency: usize,
        handle: Handle,
    ) -> Result<Self, ResilienceError> {
        let name = name.into();
        if max_concurrency == 0 {
            return Err(ResilienceError::InvalidConfig(format!(
                "executor '{}' needs at least one worker",
                name
            )));
        }

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                name,
                handle,
                max_concurrency,
                permits: Arc::new(Semaphore::new(max_concurrency)),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                spawned: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        })
    }

    /// Executor name used in log events
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Maximum number of tasks running at the same time
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Number of tasks scheduled and not yet finished (running or waiting for a slot)
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Worker slots currently free
    pub fn available_workers(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Total number of tasks accepted since creation
    pub fn spawned_total(&self) -> u64 {
        self.inner.spawned.load(Ordering::Relaxed)
    }

    /// Total number of tasks that finished with an error
    pub fn failed_total(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Schedule a task.
    ///
    /// Returns `false` (and drops the task) if the executor has been shut down.
    pub fn spawn<F, E>(&self, label: impl Into<String>, task: F) -> bool
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let label = label.into();
        if self.inner.shutdown.is_cancelled() {
            warn!(executor = %self.inner.name, task = %label, "Executor shut down, task dropped");
            return false;
        }

        self.inner.spawned.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);

        self.inner.tracker.spawn_on(
            async move {
                let _permit = tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => {
                        debug!(executor = %inner.name, task = %label, "Task cancelled before start");
                        return;
                    }
                    permit = Arc::clone(&inner.permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => {
                        debug!(executor = %inner.name, task = %label, "Task cancelled by shutdown");
                    }
                    result = task => {
                        if let Err(e) = result {
                            inner.failed.fetch_add(1, Ordering::Relaxed);
                            error!(executor = %inner.name, task = %label, error = %e, "Background task failed");
                        }
                    }
                }
            },
            &self.inner.handle,
        );

        true
    }

    /// Wait until every scheduled task has finished.
    ///
    /// Tasks scheduled by running tasks are waited for as well. Meant for a
    /// single waiter at a time.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        if !self.inner.shutdown.is_cancelled() {
            self.inner.tracker.reopen();
        }
    }

    /// Cancel all in-flight tasks, refuse new ones, and wait for them to unwind
    pub async fn shutdown(&self) {
        debug!(executor = %self.inner.name, active = self.inner.tracker.len(), "Shutting down executor");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
