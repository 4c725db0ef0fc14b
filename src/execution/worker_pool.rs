//! Worker pool running one tokio task per accepted lifecycle task

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::error::WorkerError;
use crate::models::WorkerKey;
use crate::tasks::TaskWorker;

/// Lifecycle of a registered worker; terminal once `Success` or `Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Created,
    Running,
    Success,
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("Worker already registered: {key}")]
    DuplicateWorker { key: String },

    #[error("Worker pool full: maximum {limit} concurrent tasks")]
    PoolFull { limit: usize },

    #[error("Executor is shutting down")]
    ShuttingDown,
}

struct WorkerEntry {
    worker: Arc<dyn TaskWorker>,
    status: WorkerStatus,
}

struct ExecutorInner {
    workers: RwLock<HashMap<WorkerKey, WorkerEntry>>,
    permits: Arc<Semaphore>,
    limit: usize,
    tracker: TaskTracker,
    closed: AtomicBool,
}

/// Concurrent task executor
///
/// Each accepted worker gets exactly one tokio task that drives it through
/// `before_run → run → run_success | run_error → after_run` and then
/// deregisters it. Admission is bounded by a semaphore sized from
/// [`ExecutorConfig::max_concurrent_tasks`].
///
/// # Examples
///
/// ```rust,no_run
/// use workload_worker::config::ExecutorConfig;
/// use workload_worker::execution::TaskExecutor;
///
/// #[tokio::main]
/// async fn main() {
///     let executor = TaskExecutor::new(&ExecutorConfig::default());
///     assert_eq!(executor.worker_count().await, 0);
///     executor.stop().await;
/// }
/// ```
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("limit", &self.inner.limit)
            .field("available", &self.inner.permits.available_permits())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self::with_limit(config.max_concurrent_tasks)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                workers: RwLock::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(limit)),
                limit,
                tracker: TaskTracker::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a worker and spawn its task.
    ///
    /// Nothing is spawned when the key is already registered or the pool has
    /// no free slot. Registration and spawn happen under the write lock, so a
    /// concurrent [`stop`](Self::stop) either rejects the worker or waits for it.
    pub async fn add_task(&self, worker: Arc<dyn TaskWorker>) -> Result<(), ExecutorError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::ShuttingDown);
        }

        let key = worker.key().clone();
        let mut workers = self.inner.workers.write().await;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::ShuttingDown);
        }
        if workers.contains_key(&key) {
            return Err(ExecutorError::DuplicateWorker {
                key: key.to_string(),
            });
        }

        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| ExecutorError::PoolFull {
                limit: self.inner.limit,
            })?;

        workers.insert(
            key.clone(),
            WorkerEntry {
                worker: worker.clone(),
                status: WorkerStatus::Created,
            },
        );
        debug!(worker = %key, kind = %worker.kind().as_str(), "Worker registered");

        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            let _permit = permit;
            inner.drive(key, worker).await;
        });
        drop(workers);

        Ok(())
    }

    /// Forget a worker.
    ///
    /// A running worker is rolled back and a failed one is stopped; returns
    /// the status the worker had, or `None` when it was not registered.
    pub async fn remove_task(&self, key: &WorkerKey) -> Option<WorkerStatus> {
        let entry = self.inner.workers.write().await.remove(key)?;

        match entry.status {
            WorkerStatus::Running => {
                info!(worker = %key, "Rolling back running worker");
                entry.worker.roll_back().await;
            }
            WorkerStatus::Error => {
                if let Err(e) = entry.worker.stop().await {
                    warn!(worker = %key, error = %e, "Failed to stop worker");
                }
            }
            WorkerStatus::Created | WorkerStatus::Success => {}
        }

        Some(entry.status)
    }

    /// Stop every live worker and wait until all spawned tasks have exited
    pub async fn stop(&self) {
        self.inner.closed.store(true, Ordering::Release);

        let live: Vec<(WorkerKey, Arc<dyn TaskWorker>)> = self
            .inner
            .workers
            .read()
            .await
            .iter()
            .map(|(key, entry)| (key.clone(), entry.worker.clone()))
            .collect();

        info!(workers = live.len(), "Stopping task executor");
        for (key, worker) in live {
            if let Err(e) = worker.stop().await {
                warn!(worker = %key, error = %e, "Failed to stop worker");
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Task executor stopped");
    }

    pub async fn get_worker(&self, task_id: &str, event_id: &str) -> Option<Arc<dyn TaskWorker>> {
        let key = WorkerKey::new(task_id, event_id);
        self.inner
            .workers
            .read()
            .await
            .get(&key)
            .map(|entry| entry.worker.clone())
    }

    pub async fn worker_status(&self, key: &WorkerKey) -> Option<WorkerStatus> {
        self.inner
            .workers
            .read()
            .await
            .get(key)
            .map(|entry| entry.status)
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.workers.read().await.len()
    }

    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl ExecutorInner {
    async fn drive(&self, key: WorkerKey, worker: Arc<dyn TaskWorker>) {
        self.set_status(&key, WorkerStatus::Running).await;

        let executed = AssertUnwindSafe(async {
            match worker.before_run().await {
                Ok(()) => worker.run().await,
                Err(e) => Err(e),
            }
        })
        .catch_unwind()
        .await;

        let outcome = match executed {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(worker = %key, panic = %message, "Worker panicked");
                Err(WorkerError::Panicked(message))
            }
        };

        let hook = match outcome {
            Ok(()) => {
                self.set_status(&key, WorkerStatus::Success).await;
                AssertUnwindSafe(worker.run_success()).catch_unwind().await
            }
            Err(err) => {
                self.set_status(&key, WorkerStatus::Error).await;
                warn!(worker = %key, error = %err, "Worker failed");
                AssertUnwindSafe(worker.run_error(&err)).catch_unwind().await
            }
        };
        if let Err(payload) = hook {
            error!(worker = %key, panic = %panic_message(payload.as_ref()), "Worker hook panicked");
        }

        if let Err(payload) = AssertUnwindSafe(worker.after_run()).catch_unwind().await {
            error!(worker = %key, panic = %panic_message(payload.as_ref()), "after_run panicked");
        }

        self.deregister(&key, &worker).await;
    }

    async fn set_status(&self, key: &WorkerKey, status: WorkerStatus) {
        if let Some(entry) = self.workers.write().await.get_mut(key) {
            entry.status = status;
        }
    }

    async fn deregister(&self, key: &WorkerKey, worker: &Arc<dyn TaskWorker>) {
        let mut workers = self.workers.write().await;
        if workers
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(&entry.worker, worker))
        {
            workers.remove(key);
            debug!(worker = %key, "Worker deregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::workers::{Behavior, ScriptedWorker};
    use std::time::Duration;

    async fn wait_for_count(executor: &TaskExecutor, expected: usize) {
        for _ in 0..200 {
            if executor.worker_count().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("worker count never reached {expected}");
    }

    #[tokio::test]
    async fn test_successful_worker_runs_hooks_in_order() {
        let executor = TaskExecutor::with_limit(4);
        let worker = ScriptedWorker::new("t1", "e1", Behavior::Succeed);

        executor.add_task(worker.clone()).await.unwrap();
        wait_for_count(&executor, 0).await;
        executor.stop().await;

        assert_eq!(
            worker.calls(),
            vec!["before_run", "run", "run_success", "after_run"]
        );
        assert!(worker.logger_released());
    }

    #[tokio::test]
    async fn test_failed_worker_gets_run_error() {
        let executor = TaskExecutor::with_limit(4);
        let worker = ScriptedWorker::new("t1", "e1", Behavior::Fail);

        executor.add_task(worker.clone()).await.unwrap();
        wait_for_count(&executor, 0).await;
        executor.stop().await;

        assert_eq!(
            worker.calls(),
            vec!["before_run", "run", "run_error", "after_run"]
        );
    }

    #[tokio::test]
    async fn test_panic_is_converted_into_run_error() {
        let executor = TaskExecutor::with_limit(4);
        let worker = ScriptedWorker::new("t1", "e1", Behavior::Panic);

        executor.add_task(worker.clone()).await.unwrap();
        wait_for_count(&executor, 0).await;
        executor.stop().await;

        assert_eq!(worker.calls(), vec!["before_run", "run", "run_error", "after_run"]);
        assert!(matches!(worker.last_error().as_deref(), Some(msg) if msg.contains("panicked")));
        assert_eq!(executor.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected_without_second_spawn() {
        let executor = TaskExecutor::with_limit(4);
        let first = ScriptedWorker::new("t1", "e1", Behavior::BlockUntilStopped);
        let second = ScriptedWorker::new("t1", "e1", Behavior::Succeed);

        executor.add_task(first.clone()).await.unwrap();
        let err = executor.add_task(second.clone()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::DuplicateWorker { .. }));
        assert_eq!(executor.worker_count().await, 1);

        executor.stop().await;
        assert!(second.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pool_limit_rejects_when_full() {
        let executor = TaskExecutor::with_limit(1);
        let first = ScriptedWorker::new("t1", "e1", Behavior::BlockUntilStopped);
        let second = ScriptedWorker::new("t2", "e2", Behavior::Succeed);

        executor.add_task(first).await.unwrap();
        assert_eq!(
            executor.add_task(second).await.unwrap_err(),
            ExecutorError::PoolFull { limit: 1 }
        );

        executor.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_all_workers() {
        let executor = TaskExecutor::with_limit(16);
        let workers: Vec<_> = (0..8)
            .map(|i| {
                ScriptedWorker::new(format!("t{i}"), "e", Behavior::BlockUntilStopped)
            })
            .collect();
        for worker in &workers {
            executor.add_task(worker.clone()).await.unwrap();
        }
        assert_eq!(executor.worker_count().await, 8);

        executor.stop().await;

        assert_eq!(executor.worker_count().await, 0);
        for worker in &workers {
            assert!(worker.calls().contains(&"after_run"));
        }
        assert!(matches!(
            executor
                .add_task(ScriptedWorker::new("late", "e", Behavior::Succeed))
                .await,
            Err(ExecutorError::ShuttingDown)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_racing_admissions_leaves_no_worker() {
        for round in 0..25 {
            let executor = TaskExecutor::with_limit(64);
            let admitting = executor.clone();
            let admissions = tokio::spawn(async move {
                for i in 0.. {
                    let worker = ScriptedWorker::new(
                        format!("t{round}-{i}"),
                        "e",
                        Behavior::BlockUntilStopped,
                    );
                    match admitting.add_task(worker).await {
                        Ok(()) | Err(ExecutorError::PoolFull { .. }) => tokio::task::yield_now().await,
                        Err(_) => break,
                    }
                }
            });
            tokio::task::yield_now().await;

            tokio::time::timeout(Duration::from_secs(5), executor.stop())
                .await
                .expect("stop finished");
            assert_eq!(executor.worker_count().await, 0);
            admissions.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_remove_running_worker_rolls_back() {
        let executor = TaskExecutor::with_limit(4);
        let worker = ScriptedWorker::new("t1", "e1", Behavior::BlockUntilStopped);
        executor.add_task(worker.clone()).await.unwrap();
        worker.wait_started().await;

        let status = executor.remove_task(worker.key()).await;
        assert_eq!(status, Some(WorkerStatus::Running));
        assert!(worker.calls().contains(&"roll_back"));
        assert!(executor.get_worker("t1", "e1").await.is_none());

        executor.stop().await;
    }
}
