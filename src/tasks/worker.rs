//! Cooperative background worker that drains the task queue.
//!
//! One logical thread of execution: pick the next queued task, run it through
//! the injected executor, and apply the retry policy on failure. Backoff
//! sleeps happen inside the loop iteration, not on a scheduler. Stop is
//! observed within one iteration; a 30 s soft deadline guards shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::tasks::queue::{Task, TaskQueue};
use crate::tasks::ToolExecutor;

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("background worker is already running")]
    AlreadyRunning,
}

/// Retry policy for failed tasks.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum retry attempts before a task fails terminally
    pub max_retries: u32,

    /// First backoff delay; doubles on every retry
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, retry_count: u32) -> Duration {
        self.initial_backoff * 2u32.saturating_pow(retry_count)
    }
}

const IDLE_SLEEP: Duration = Duration::from_secs(1);
const BETWEEN_TASKS_SLEEP: Duration = Duration::from_millis(100);
const ERROR_SLEEP: Duration = Duration::from_secs(5);
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Single-threaded background worker over the shared task queue.
pub struct BackgroundWorker {
    queue: Arc<TaskQueue>,
    executor: Arc<dyn ToolExecutor>,
    policy: RetryPolicy,
    is_running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundWorker {
    pub fn new(queue: Arc<TaskQueue>, executor: Arc<dyn ToolExecutor>, policy: RetryPolicy) -> Self {
        log::info!(
            "Background worker initialized (max_retries={}, initial_backoff={:?})",
            policy.max_retries,
            policy.initial_backoff
        );
        Self {
            queue,
            executor,
            policy,
            is_running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Whether the worker loop is active.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Start the worker loop as a background task.
    ///
    /// Returns immediately; errors if the worker is already running.
    pub fn start(&self) -> Result<(), WorkerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        let queue = Arc::clone(&self.queue);
        let executor = Arc::clone(&self.executor);
        let policy = self.policy;
        let is_running = Arc::clone(&self.is_running);

        let handle = tokio::spawn(async move {
            worker_loop(queue, executor, policy, is_running).await;
        });
        *self.handle.lock() = Some(handle);

        log::info!("Background worker started");
        Ok(())
    }

    /// Stop the worker, waiting up to the soft deadline before cancelling.
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            log::warn!("Background worker is not running");
            return;
        }

        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            match tokio::time::timeout(SHUTDOWN_DEADLINE, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    log::warn!("Background worker did not stop gracefully, cancelling");
                    handle.abort();
                }
            }
        }

        log::info!("Background worker stopped");
    }
}

async fn worker_loop(
    queue: Arc<TaskQueue>,
    executor: Arc<dyn ToolExecutor>,
    policy: RetryPolicy,
    is_running: Arc<AtomicBool>,
) {
    log::info!("Worker loop started");

    while is_running.load(Ordering::SeqCst) {
        match process_next_task(&queue, &executor, &policy).await {
            Ok(true) => tokio::time::sleep(BETWEEN_TASKS_SLEEP).await,
            Ok(false) => tokio::time::sleep(IDLE_SLEEP).await,
            Err(e) => {
                // Error-storm guard.
                log::error!("Unexpected error in worker loop: {}", e);
                tokio::time::sleep(ERROR_SLEEP).await;
            }
        }
    }

    log::info!("Worker loop stopped");
}

/// Process one task from the queue. Returns `false` when the queue is empty.
async fn process_next_task(
    queue: &TaskQueue,
    executor: &Arc<dyn ToolExecutor>,
    policy: &RetryPolicy,
) -> Result<bool, crate::tasks::queue::TaskError> {
    let task = match queue.peek_next()? {
        Some(task) => task,
        None => return Ok(false),
    };

    log::info!(
        "Processing task {} (operation={}, priority={})",
        task.task_id,
        task.operation,
        task.priority
    );
    queue.mark_running(&task.task_id)?;

    match executor.execute(&task.operation, &task.parameters).await {
        Ok(result) => {
            let envelope = json!({
                "success": true,
                "operation": task.operation,
                "result": result,
            });
            queue.mark_completed(&task.task_id, &envelope)?;
            log::info!("Task {} completed successfully", task.task_id);
        }
        Err(e) => handle_task_failure(queue, policy, &task, &e.to_string()).await?,
    }

    Ok(true)
}

/// Apply the retry policy to a failed task.
///
/// With retries remaining, the task goes back to `queued` and the worker
/// sleeps out the backoff before looking at the queue again; otherwise the
/// task fails terminally.
async fn handle_task_failure(
    queue: &TaskQueue,
    policy: &RetryPolicy,
    task: &Task,
    error: &str,
) -> Result<(), crate::tasks::queue::TaskError> {
    if task.retry_count < policy.max_retries {
        let backoff = policy.backoff_for(task.retry_count);
        log::warn!(
            "Task {} failed, will retry in {:?} (attempt {}/{}): {}",
            task.task_id,
            backoff,
            task.retry_count + 1,
            policy.max_retries,
            error
        );

        queue.requeue_for_retry(&task.task_id, task.retry_count + 1, error)?;
        tokio::time::sleep(backoff).await;
    } else {
        log::error!(
            "Task {} failed permanently after {} retries: {}",
            task.task_id,
            task.retry_count,
            error
        );
        queue.mark_failed(&task.task_id, error)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ConnectionPool, StoreConfig};
    use crate::tasks::queue::TaskStatus;
    use crate::tasks::ExecutorError;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;
    use std::time::Instant;

    struct ScriptedExecutor {
        /// Number of leading calls that fail before the executor succeeds.
        failures: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedExecutor {
        fn failing_first(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ToolExecutor for ScriptedExecutor {
        async fn execute(&self, _operation: &str, _parameters: &Value) -> Result<Value, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                Err("simulated failure".into())
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    fn test_queue(dir: &tempfile::TempDir) -> Arc<TaskQueue> {
        let pool = Arc::new(
            ConnectionPool::open(StoreConfig::at_path(dir.path().join("cache.db"), None)).unwrap(),
        );
        Arc::new(TaskQueue::new(pool))
    }

    async fn wait_for_terminal(queue: &TaskQueue, task_id: &str) -> TaskStatus {
        for _ in 0..200 {
            let task = queue.get_status(task_id).unwrap();
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                return task.status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("task {task_id} did not reach a terminal state");
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_start_twice_errors() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        let worker = BackgroundWorker::new(
            queue,
            Arc::new(ScriptedExecutor::failing_first(0)),
            fast_policy(3),
        );

        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(WorkerError::AlreadyRunning)));
        worker.stop().await;
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_successful_task_records_result_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        let id = queue
            .enqueue("acc", "folder_get_tree", &json!({"folder_id": "root"}), 5)
            .unwrap();

        let worker = BackgroundWorker::new(
            Arc::clone(&queue),
            Arc::new(ScriptedExecutor::failing_first(0)),
            fast_policy(3),
        );
        worker.start().unwrap();

        assert_eq!(wait_for_terminal(&queue, &id).await, TaskStatus::Completed);
        worker.stop().await;

        let task = queue.get_status(&id).unwrap();
        let result: Value = serde_json::from_str(task.result.as_deref().unwrap()).unwrap();
        assert_eq!(
            result,
            json!({"success": true, "operation": "folder_get_tree", "result": {"ok": true}})
        );
    }

    #[tokio::test]
    async fn test_retry_then_succeed_with_backoff() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        let id = queue.enqueue("acc", "email_list", &json!({}), 5).unwrap();

        let executor = Arc::new(ScriptedExecutor::failing_first(2));
        let worker = BackgroundWorker::new(Arc::clone(&queue), Arc::clone(&executor) as Arc<dyn ToolExecutor>, fast_policy(3));

        let started = Instant::now();
        worker.start().unwrap();
        assert_eq!(wait_for_terminal(&queue, &id).await, TaskStatus::Completed);
        let elapsed = started.elapsed();
        worker.stop().await;

        // Third attempt succeeded after two failures.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        let task = queue.get_status(&id).unwrap();
        assert_eq!(task.retry_count, 2);

        // Backoff of 50ms then 100ms sits between the failures.
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_retries_exhausted_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        let id = queue.enqueue("acc", "email_list", &json!({}), 5).unwrap();

        let worker = BackgroundWorker::new(
            Arc::clone(&queue),
            Arc::new(ScriptedExecutor::failing_first(u32::MAX)),
            fast_policy(2),
        );
        worker.start().unwrap();

        assert_eq!(wait_for_terminal(&queue, &id).await, TaskStatus::Failed);
        worker.stop().await;

        let task = queue.get_status(&id).unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error.as_deref(), Some("simulated failure"));
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_priority_order_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);

        let low = queue.enqueue("acc", "op-low", &json!({}), 10).unwrap();
        let high = queue.enqueue("acc", "op-high", &json!({}), 1).unwrap();

        let worker = BackgroundWorker::new(
            Arc::clone(&queue),
            Arc::new(ScriptedExecutor::failing_first(0)),
            fast_policy(3),
        );
        worker.start().unwrap();

        wait_for_terminal(&queue, &low).await;
        worker.stop().await;

        let high_task = queue.get_status(&high).unwrap();
        let low_task = queue.get_status(&low).unwrap();
        assert!(high_task.completed_at.unwrap() <= low_task.completed_at.unwrap());
    }
}
