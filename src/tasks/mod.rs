//! Durable background task queue and its worker.
//!
//! Tasks are persisted in the shared encrypted store (`cache_tasks` table),
//! ordered by priority then age, and drained by a single cooperative worker
//! with exponential-backoff retries.

pub mod queue;
pub mod worker;

use async_trait::async_trait;
use serde_json::Value;

pub use queue::{Task, TaskError, TaskQueue, TaskResult, TaskStatus};
pub use worker::{BackgroundWorker, RetryPolicy, WorkerError};

/// Boxed error type produced by injected executors.
pub type ExecutorError = Box<dyn std::error::Error + Send + Sync>;

/// Executes queued operations against the tool layer.
///
/// The worker never interprets `operation`; the tool layer registers one
/// implementation at startup and is the only place that maps operation names
/// to concrete calls.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, operation: &str, parameters: &Value) -> Result<Value, ExecutorError>;
}
