//! Composition root wiring the cache subsystem together.
//!
//! The cache manager, task queue, worker, and warmer are process-wide
//! resources with explicit init and teardown. The server wires them here once
//! at startup, injecting the executors, instead of reaching for globals: the
//! cache holds no references to tools, and tools talk back only through
//! string invalidation patterns.

use std::sync::Arc;

use thiserror::Error;

use crate::cache::CacheManager;
use crate::encryption::{KeyError, KeyManager};
use crate::storage::{ConnectionPool, StorageError, StoreConfig};
use crate::tasks::{BackgroundWorker, RetryPolicy, TaskQueue, ToolExecutor};
use crate::warming::{CacheWarmer, WarmingExecutor};

/// Startup errors
#[derive(Error, Debug)]
pub enum SystemError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The assembled cache subsystem.
pub struct CacheSystem {
    pub cache: Arc<CacheManager>,
    pub queue: Arc<TaskQueue>,
    pub worker: Arc<BackgroundWorker>,
    pub warmer: Arc<CacheWarmer>,
}

impl CacheSystem {
    /// Build the subsystem over an encrypted store at the default location,
    /// resolving the encryption key from the keyring or environment.
    pub fn init(
        tool_executor: Arc<dyn ToolExecutor>,
        warming_executor: Arc<dyn WarmingExecutor>,
        accounts: Vec<String>,
    ) -> Result<Self, SystemError> {
        let key = KeyManager::get_or_create_key()?;
        Self::init_with_config(
            StoreConfig::new(key),
            RetryPolicy::default(),
            tool_executor,
            warming_executor,
            accounts,
        )
    }

    /// Build the subsystem over an explicit store configuration.
    pub fn init_with_config(
        store: StoreConfig,
        retry: RetryPolicy,
        tool_executor: Arc<dyn ToolExecutor>,
        warming_executor: Arc<dyn WarmingExecutor>,
        accounts: Vec<String>,
    ) -> Result<Self, SystemError> {
        let pool = Arc::new(ConnectionPool::open(store)?);
        let cache = Arc::new(CacheManager::new(Arc::clone(&pool)));
        let queue = Arc::new(TaskQueue::new(Arc::clone(&pool)));
        let worker = Arc::new(BackgroundWorker::new(
            Arc::clone(&queue),
            tool_executor,
            retry,
        ));
        let warmer = Arc::new(CacheWarmer::new(
            Arc::clone(&cache),
            warming_executor,
            accounts,
        ));

        Ok(Self {
            cache,
            queue,
            worker,
            warmer,
        })
    }

    /// Start the background worker and kick off cache warming.
    pub fn start(&self) -> Result<(), crate::tasks::WorkerError> {
        self.worker.start()?;
        self.warmer.start();
        Ok(())
    }

    /// Stop the background worker. The warmer terminates on its own when its
    /// queue drains.
    pub async fn shutdown(&self) {
        self.worker.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{ExecutorError, TaskStatus};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, operation: &str, _parameters: &Value) -> Result<Value, ExecutorError> {
            Ok(json!({"echo": operation}))
        }
    }

    #[async_trait]
    impl WarmingExecutor for EchoExecutor {
        async fn execute(
            &self,
            _account_id: &str,
            operation: &str,
            _parameters: &Value,
        ) -> Result<Value, ExecutorError> {
            Ok(json!({"echo": operation}))
        }
    }

    #[tokio::test]
    async fn test_init_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(EchoExecutor);
        let system = CacheSystem::init_with_config(
            StoreConfig::at_path(dir.path().join("cache.db"), None),
            RetryPolicy::default(),
            executor.clone(),
            executor,
            Vec::new(),
        )
        .unwrap();

        system.start().unwrap();

        let id = system
            .queue
            .enqueue("acc", "folder_get_tree", &json!({}), 1)
            .unwrap();

        for _ in 0..200 {
            if system.queue.get_status(&id).unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        assert_eq!(
            system.queue.get_status(&id).unwrap().status,
            TaskStatus::Completed
        );

        system.shutdown().await;
        assert!(!system.worker.is_running());
    }
}
