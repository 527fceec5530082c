// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock executor for testing.
//!
//! Simulates action execution without spawning worker processes.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::traits::*;

/// Mock executor for testing.
pub struct MockExecutor {
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
    launched: Arc<Mutex<Vec<LaunchOptions>>>,
    /// Optional delay to simulate execution time (in milliseconds)
    pub execution_delay_ms: u64,
    /// If true, executions fail by default
    pub fail_by_default: bool,
    /// If true, executions run until cancelled.
    /// This is useful for testing timeouts and cancellation.
    pub never_complete: bool,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    /// Create a new mock executor.
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            launched: Arc::new(Mutex::new(Vec::new())),
            execution_delay_ms: 10,
            fail_by_default: false,
            never_complete: false,
        }
    }

    /// Create a mock executor that fails by default.
    pub fn failing() -> Self {
        Self {
            fail_by_default: true,
            ..Self::new()
        }
    }

    /// Create a mock executor whose executions only end when cancelled.
    pub fn never_completing() -> Self {
        Self {
            execution_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Every launch seen so far, in submission order.
    pub async fn launched(&self) -> Vec<LaunchOptions> {
        self.launched.lock().await.clone()
    }

    /// Number of executions currently in flight.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn executor_type(&self) -> &'static str {
        "mock"
    }

    async fn execute(&self, options: LaunchOptions) -> RunOutcome {
        let start = std::time::Instant::now();
        let token = options.cancel.clone();
        self.launched.lock().await.push(options.clone());
        self.active
            .lock()
            .await
            .insert(options.run_id.clone(), token.clone());

        let cancelled = if self.never_complete {
            token.cancelled().await;
            true
        } else {
            tokio::select! {
                _ = token.cancelled() => true,
                _ = tokio::time::sleep(Duration::from_millis(self.execution_delay_ms)) => false,
            }
        };

        self.active.lock().await.remove(&options.run_id);

        let mut outcome = if cancelled {
            RunOutcome::cancelled("run was cancelled")
        } else if self.fail_by_default {
            RunOutcome::failed("Mock failure")
        } else {
            RunOutcome::passed(Some(json!({ "echo": options.input })))
                .with_output("mock output\n".to_string(), String::new(), Some(0))
        };
        outcome.duration_ms = start.elapsed().as_millis() as u64;
        outcome
    }

    async fn cancel(&self, run_id: &str) -> bool {
        match self.active.lock().await.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn stats(&self) -> PoolStats {
        PoolStats {
            busy: self.active.lock().await.len(),
            ..PoolStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ActionRef;
    use cadence_core::status::RunStatus;
    use std::path::PathBuf;

    fn test_options() -> LaunchOptions {
        LaunchOptions {
            run_id: "test-run-123".to_string(),
            action: ActionRef {
                action_id: "pkg.echo".to_string(),
                package_id: "pkg".to_string(),
                name: "echo".to_string(),
                entry_point: "echo:main".to_string(),
            },
            input: json!({"key": "value"}),
            artifacts_dir: PathBuf::from("/tmp/runs/test-run-123"),
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_mock_executor_success() {
        let executor = MockExecutor::new();

        let outcome = executor.execute(test_options()).await;

        assert_eq!(outcome.status, RunStatus::Passed);
        assert_eq!(outcome.result, Some(json!({"echo": {"key": "value"}})));
        assert!(outcome.error.is_none());
        assert_eq!(executor.launched().await.len(), 1);
    }

    #[tokio::test]
    async fn test_mock_executor_failure() {
        let executor = MockExecutor::failing();

        let outcome = executor.execute(test_options()).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("Mock failure"));
    }

    #[tokio::test]
    async fn test_mock_executor_cancel() {
        let executor = Arc::new(MockExecutor::never_completing());

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(test_options()).await })
        };

        // Wait for the execution to register
        while executor.active_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.stats().await.busy, 1);

        assert!(executor.cancel("test-run-123").await);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(!executor.cancel("test-run-123").await);
    }

    #[tokio::test]
    async fn test_mock_executor_cancelled_before_start() {
        let executor = MockExecutor::never_completing();
        let options = test_options();
        options.cancel.cancel();

        let outcome = executor.execute(options).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert_eq!(executor.active_count().await, 0);
    }
}
