//! Persistent priority task queue backed by the `cache_tasks` table.
//!
//! Queued and in-flight tasks survive restarts. Selection is strictly
//! `(priority ASC, created_at ASC)`, so FIFO within a priority level. A row
//! left in `running` by a crash is not re-picked; operators reclaim manually.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::storage::{unix_now, ConnectionPool, StorageError};

/// Task queue errors
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid priority: {0} (expected 1..=10)")]
    InvalidPriority(u8),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result type for queue operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A queued background task.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: String,
    pub account_id: String,
    pub operation: String,
    pub parameters: Value,
    pub priority: u8,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Persistent priority queue over the shared store.
pub struct TaskQueue {
    pool: Arc<ConnectionPool>,
}

impl TaskQueue {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Enqueue a background task. Priority 1 is highest, 10 lowest.
    pub fn enqueue(
        &self,
        account_id: &str,
        operation: &str,
        parameters: &Value,
        priority: u8,
    ) -> TaskResult<String> {
        if !(1..=10).contains(&priority) {
            return Err(TaskError::InvalidPriority(priority));
        }

        let task_id = Uuid::new_v4().to_string();
        let parameters_json = parameters.to_string();

        self.pool.with_conn(|tx| {
            tx.execute(
                "INSERT INTO cache_tasks \
                 (task_id, account_id, operation, parameters_json, priority, status, retry_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, ?6)",
                params![task_id, account_id, operation, parameters_json, priority, unix_now()],
            )
            .map(|_| ())
        })?;

        log::info!(
            "Task enqueued: {} (operation={}, priority={})",
            task_id,
            operation,
            priority
        );
        Ok(task_id)
    }

    /// Highest-priority queued task, FIFO within a priority level.
    pub fn peek_next(&self) -> TaskResult<Option<Task>> {
        let task = self.pool.with_conn(|tx| {
            tx.query_row(
                &format!("{SELECT_TASK} WHERE status = 'queued' ORDER BY priority ASC, created_at ASC LIMIT 1"),
                [],
                task_from_row,
            )
            .optional()
        })?;
        Ok(task)
    }

    /// Transition a task to `running`, recording the start time.
    pub fn mark_running(&self, task_id: &str) -> TaskResult<()> {
        self.update_status(
            task_id,
            "UPDATE cache_tasks SET status = 'running', started_at = ?1 WHERE task_id = ?2",
        )
    }

    /// Transition a task to `completed` with its result.
    pub fn mark_completed(&self, task_id: &str, result: &Value) -> TaskResult<()> {
        let result_json = result.to_string();
        let now = unix_now();
        let updated = self.pool.with_conn(move |tx| {
            tx.execute(
                "UPDATE cache_tasks SET status = 'completed', completed_at = ?1, result_json = ?2 \
                 WHERE task_id = ?3",
                params![now, result_json, task_id],
            )
        })?;
        ensure_found(updated, task_id)
    }

    /// Transition a task to terminal `failed` with its last error.
    pub fn mark_failed(&self, task_id: &str, error: &str) -> TaskResult<()> {
        let now = unix_now();
        let updated = self.pool.with_conn(move |tx| {
            tx.execute(
                "UPDATE cache_tasks SET status = 'failed', completed_at = ?1, last_error = ?2 \
                 WHERE task_id = ?3",
                params![now, error, task_id],
            )
        })?;
        ensure_found(updated, task_id)
    }

    /// Put a failed task back in the queue for another attempt.
    pub fn requeue_for_retry(
        &self,
        task_id: &str,
        retry_count: u32,
        error: &str,
    ) -> TaskResult<()> {
        let updated = self.pool.with_conn(move |tx| {
            tx.execute(
                "UPDATE cache_tasks SET status = 'queued', retry_count = ?1, last_error = ?2 \
                 WHERE task_id = ?3",
                params![retry_count, error, task_id],
            )
        })?;
        ensure_found(updated, task_id)
    }

    /// Fetch a task by id.
    pub fn get_status(&self, task_id: &str) -> TaskResult<Task> {
        let task = self.pool.with_conn(|tx| {
            tx.query_row(
                &format!("{SELECT_TASK} WHERE task_id = ?1"),
                params![task_id],
                task_from_row,
            )
            .optional()
        })?;
        task.ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    /// List tasks, newest first, optionally filtered by account and status.
    pub fn list(
        &self,
        account_id: Option<&str>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> TaskResult<Vec<Task>> {
        let status_str = status.map(|s| s.as_str());
        let tasks = self.pool.with_conn(|tx| {
            let mut stmt = tx.prepare(&format!(
                "{SELECT_TASK} WHERE (?1 IS NULL OR account_id = ?1) \
                 AND (?2 IS NULL OR status = ?2) \
                 ORDER BY created_at DESC LIMIT ?3"
            ))?;
            let rows = stmt.query_map(params![account_id, status_str, limit as i64], task_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()
        })?;
        Ok(tasks)
    }

    fn update_status(&self, task_id: &str, sql: &str) -> TaskResult<()> {
        let now = unix_now();
        let updated = self
            .pool
            .with_conn(move |tx| tx.execute(sql, params![now, task_id]))?;
        ensure_found(updated, task_id)
    }
}

const SELECT_TASK: &str = "SELECT task_id, account_id, operation, parameters_json, priority, \
     status, retry_count, created_at, started_at, completed_at, result_json, last_error \
     FROM cache_tasks";

fn ensure_found(updated: usize, task_id: &str) -> TaskResult<()> {
    if updated == 0 {
        Err(TaskError::NotFound(task_id.to_string()))
    } else {
        Ok(())
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let parameters_json: Option<String> = row.get(3)?;
    let status_raw: String = row.get(5)?;

    Ok(Task {
        task_id: row.get(0)?,
        account_id: row.get(1)?,
        operation: row.get(2)?,
        parameters: parameters_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_else(|| Value::Object(Default::default())),
        priority: row.get(4)?,
        status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Failed),
        retry_count: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        result: row.get(10)?,
        error: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use serde_json::json;

    fn test_queue(dir: &tempfile::TempDir) -> TaskQueue {
        let pool = Arc::new(
            ConnectionPool::open(StoreConfig::at_path(dir.path().join("cache.db"), None)).unwrap(),
        );
        TaskQueue::new(pool)
    }

    #[test]
    fn test_enqueue_and_get_status() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);

        let id = queue
            .enqueue("acc", "folder_get_tree", &json!({"folder_id": "root"}), 5)
            .unwrap();

        let task = queue.get_status(&id).unwrap();
        assert_eq!(task.account_id, "acc");
        assert_eq!(task.operation, "folder_get_tree");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_none());
        assert_eq!(task.parameters, json!({"folder_id": "root"}));
    }

    #[test]
    fn test_get_status_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        assert!(matches!(
            queue.get_status("no-such-task"),
            Err(TaskError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_priority_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        assert!(matches!(
            queue.enqueue("acc", "email_list", &json!({}), 0),
            Err(TaskError::InvalidPriority(0))
        ));
        assert!(matches!(
            queue.enqueue("acc", "email_list", &json!({}), 11),
            Err(TaskError::InvalidPriority(11))
        ));
    }

    #[test]
    fn test_peek_orders_by_priority_then_age() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);

        let low = queue.enqueue("acc", "op", &json!({}), 10).unwrap();
        let high = queue.enqueue("acc", "op", &json!({}), 1).unwrap();
        let mid = queue.enqueue("acc", "op", &json!({}), 5).unwrap();

        for expected in [&high, &mid, &low] {
            let task = queue.peek_next().unwrap().unwrap();
            assert_eq!(&task.task_id, expected);
            queue.mark_running(&task.task_id).unwrap();
        }
        assert!(queue.peek_next().unwrap().is_none());
    }

    #[test]
    fn test_fifo_within_priority() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);

        let first = queue.enqueue("acc", "op", &json!({}), 5).unwrap();
        // Later row with an explicitly later timestamp to avoid clock ties.
        let second = queue.enqueue("acc", "op", &json!({}), 5).unwrap();
        queue
            .pool
            .with_conn(|tx| {
                tx.execute(
                    "UPDATE cache_tasks SET created_at = created_at + 1 WHERE task_id = ?1",
                    params![second],
                )
            })
            .unwrap();

        assert_eq!(queue.peek_next().unwrap().unwrap().task_id, first);
    }

    #[test]
    fn test_status_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        let id = queue.enqueue("acc", "op", &json!({}), 5).unwrap();

        queue.mark_running(&id).unwrap();
        let task = queue.get_status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_none());

        queue.mark_completed(&id, &json!({"ok": true})).unwrap();
        let task = queue.get_status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result.as_deref(), Some(r#"{"ok":true}"#));
    }

    #[test]
    fn test_requeue_for_retry_and_terminal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        let id = queue.enqueue("acc", "op", &json!({}), 5).unwrap();

        queue.mark_running(&id).unwrap();
        queue.requeue_for_retry(&id, 1, "boom").unwrap();

        let task = queue.get_status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error.as_deref(), Some("boom"));

        queue.mark_running(&id).unwrap();
        queue.mark_failed(&id, "boom again").unwrap();
        let task = queue.get_status(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_running_tasks_are_not_repicked() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);
        let id = queue.enqueue("acc", "op", &json!({}), 5).unwrap();

        queue.mark_running(&id).unwrap();
        assert!(queue.peek_next().unwrap().is_none());
    }

    #[test]
    fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir);

        let a = queue.enqueue("acc-a", "op", &json!({}), 5).unwrap();
        let b = queue.enqueue("acc-b", "op", &json!({}), 5).unwrap();
        queue.mark_running(&b).unwrap();
        queue.mark_failed(&b, "x").unwrap();

        let all = queue.list(None, None, 50).unwrap();
        assert_eq!(all.len(), 2);

        let for_a = queue.list(Some("acc-a"), None, 50).unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].task_id, a);

        let failed = queue.list(None, Some(TaskStatus::Failed), 50).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, b);

        let limited = queue.list(None, None, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }
}
