//! Startup cache warming.
//!
//! Pre-populates the cache with the data accounts touch first (folder tree,
//! inbox listing, contacts) so initial tool calls hit warm entries. Warming
//! runs on one background task, throttled between operations, and never
//! blocks startup; a failed operation is counted and skipped, never fatal.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::cache::config::{warming_plan, CacheState, WarmingOperation};
use crate::cache::CacheManager;
use crate::tasks::ExecutorError;

/// Executes warming operations against the tool layer for one account.
#[async_trait]
pub trait WarmingExecutor: Send + Sync {
    async fn execute(
        &self,
        account_id: &str,
        operation: &str,
        parameters: &Value,
    ) -> Result<Value, ExecutorError>;
}

/// Warming progress telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct WarmingStatus {
    pub is_warming: bool,
    pub operations_total: usize,
    pub operations_completed: usize,
    pub operations_skipped: usize,
    pub operations_failed: usize,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Default)]
struct WarmingState {
    is_warming: bool,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    total: usize,
    completed: usize,
    skipped: usize,
    failed: usize,
}

/// Warms the cache for a set of accounts at startup.
pub struct CacheWarmer {
    cache: Arc<CacheManager>,
    executor: Arc<dyn WarmingExecutor>,
    accounts: Vec<String>,
    state: Arc<RwLock<WarmingState>>,
}

impl CacheWarmer {
    pub fn new(
        cache: Arc<CacheManager>,
        executor: Arc<dyn WarmingExecutor>,
        accounts: Vec<String>,
    ) -> Self {
        Self {
            cache,
            executor,
            accounts,
            state: Arc::new(RwLock::new(WarmingState::default())),
        }
    }

    /// Start warming in the background.
    ///
    /// Returns immediately. Does nothing when warming is already in progress
    /// or no accounts are configured.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if state.is_warming {
                log::warn!("Cache warming already in progress");
                return;
            }
            if self.accounts.is_empty() {
                log::info!("No accounts configured, skipping cache warming");
                return;
            }
            state.is_warming = true;
            state.started_at = Some(Utc::now());
            state.completed_at = None;
            state.completed = 0;
            state.skipped = 0;
            state.failed = 0;
        }

        log::info!("Starting cache warming for {} account(s)", self.accounts.len());

        let queue = self.build_queue();
        self.state.write().total = queue.len();

        let warmer = Arc::clone(self);
        tokio::spawn(async move {
            warmer.warming_loop(queue).await;
        });
    }

    /// Current warming telemetry.
    pub fn status(&self) -> WarmingStatus {
        let state = self.state.read();

        let duration = match (state.started_at, state.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            (Some(started), None) if state.is_warming => {
                Some((Utc::now() - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };

        let progress = if state.total > 0 {
            state.completed as f64 / state.total as f64 * 100.0
        } else {
            0.0
        };

        WarmingStatus {
            is_warming: state.is_warming,
            operations_total: state.total,
            operations_completed: state.completed,
            operations_skipped: state.skipped,
            operations_failed: state.failed,
            progress_percent: (progress * 10.0).round() / 10.0,
            started_at: state.started_at.map(|t| t.to_rfc3339()),
            completed_at: state.completed_at.map(|t| t.to_rfc3339()),
            duration_seconds: duration.map(|d| (d * 100.0).round() / 100.0),
        }
    }

    /// Accounts × plan, ordered by plan priority.
    fn build_queue(&self) -> Vec<(String, WarmingOperation)> {
        let mut queue: Vec<(String, WarmingOperation)> = self
            .accounts
            .iter()
            .flat_map(|account| {
                warming_plan()
                    .into_iter()
                    .map(move |op| (account.clone(), op))
            })
            .collect();
        queue.sort_by_key(|(_, op)| op.priority);
        queue
    }

    async fn warming_loop(&self, queue: Vec<(String, WarmingOperation)>) {
        for (account_id, op) in queue {
            let fresh = matches!(
                self.cache
                    .get_cached(&account_id, &op.operation, Some(&op.params)),
                Some((_, CacheState::Fresh))
            );

            if fresh {
                log::debug!("Skipping {} (already cached)", op.operation);
                let mut state = self.state.write();
                state.skipped += 1;
                state.completed += 1;
                continue;
            }

            match self
                .executor
                .execute(&account_id, &op.operation, &op.params)
                .await
            {
                Ok(result) => {
                    if let Err(e) =
                        self.cache
                            .set_cached(&account_id, &op.operation, Some(&op.params), &result)
                    {
                        log::warn!("Could not cache warmed {}: {}", op.operation, e);
                    }
                    self.state.write().completed += 1;
                }
                Err(e) => {
                    log::warn!("Failed to warm cache for {}: {}", op.operation, e);
                    let mut state = self.state.write();
                    state.failed += 1;
                    state.completed += 1;
                }
            }

            if !op.throttle.is_zero() {
                tokio::time::sleep(op.throttle).await;
            }
        }

        let mut state = self.state.write();
        state.completed_at = Some(Utc::now());
        state.is_warming = false;

        let warmed = state.completed - state.failed - state.skipped;
        log::info!(
            "Cache warming completed: {} warmed, {} skipped, {} failed",
            warmed,
            state.skipped,
            state.failed
        );
    }
}
