// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor trait definitions.
//!
//! Defines the abstract interface the orchestrator uses to run actions.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::status::RunStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::registry::ActionRef;

/// Errors from worker process management.
///
/// These never reach `start_run` callers; the pool turns them into FAILED
/// outcomes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RunnerError {
    /// Worker process could not be started.
    #[error("Worker spawn failed: {0}")]
    SpawnFailed(String),

    /// Worker exited or closed stdout without replying.
    #[error("Worker exited (code {exit_code:?}): {stderr}")]
    WorkerExited {
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured stderr.
        stderr: String,
    },

    /// Execution exceeded its time limit.
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// Pool is shutting down.
    #[error("Process pool is shut down")]
    PoolClosed,

    /// I/O with the worker failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request could not be encoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for runner operations.
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Options for executing one run.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Run ID (UUID). Also the cancellation key.
    pub run_id: String,
    /// Action to execute.
    pub action: ActionRef,
    /// Input for the action.
    pub input: Value,
    /// Absolute artifact directory for this run.
    pub artifacts_dir: PathBuf,
    /// Requested time limit. The pool applies its own ceiling on top.
    pub timeout: Option<Duration>,
    /// Cancelled by the owner of the run. May fire before the executor
    /// picks the run up.
    pub cancel: CancellationToken,
}

/// Terminal result of an execution. Executors never return errors; every
/// failure mode is a FAILED or CANCELLED outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    /// PASSED, FAILED or CANCELLED.
    pub status: RunStatus,
    /// Result reported by the action.
    pub result: Option<Value>,
    /// Error message for FAILED and CANCELLED outcomes.
    pub error: Option<String>,
    /// Captured stdout, excluding the protocol reply line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Worker exit code, when the worker exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Execution duration in milliseconds.
    pub duration_ms: u64,
}

impl RunOutcome {
    /// A passing outcome.
    pub fn passed(result: Option<Value>) -> Self {
        Self {
            status: RunStatus::Passed,
            result,
            ..Self::empty()
        }
    }

    /// A failing outcome.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
            ..Self::empty()
        }
    }

    /// A cancelled outcome.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Cancelled,
            error: Some(reason.into()),
            ..Self::empty()
        }
    }

    fn empty() -> Self {
        Self {
            status: RunStatus::Failed,
            result: None,
            error: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            duration_ms: 0,
        }
    }

    /// Attach captured process output.
    pub fn with_output(
        mut self,
        stdout: String,
        stderr: String,
        exit_code: Option<i32>,
    ) -> Self {
        self.stdout = (!stdout.is_empty()).then_some(stdout);
        self.stderr = (!stderr.is_empty()).then_some(stderr);
        self.exit_code = exit_code;
        self
    }
}

impl From<RunnerError> for RunOutcome {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::WorkerExited { exit_code, stderr } => {
                RunOutcome::failed(match exit_code {
                    Some(code) => format!("worker exited with code {} before replying", code),
                    None => "worker was terminated before replying".to_string(),
                })
                .with_output(String::new(), stderr, exit_code)
            }
            other => RunOutcome::failed(other.to_string()),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Workers alive and waiting for work.
    pub idle: usize,
    /// Slots executing (or spawning a worker for) a run.
    pub busy: usize,
    /// Submissions waiting for a slot.
    pub queued: usize,
    /// Configured minimum.
    pub min_processes: usize,
    /// Configured maximum.
    pub max_processes: usize,
}

/// Trait for action executors.
///
/// Executors are PURE execution engines - they do NOT access the database.
/// Persisting run transitions is the orchestrator's job.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor type identifier (e.g., "process_pool", "mock")
    fn executor_type(&self) -> &'static str;

    /// Execute a run to completion, waiting for a free slot if necessary.
    async fn execute(&self, options: LaunchOptions) -> RunOutcome;

    /// Request cancellation of a queued or executing run.
    ///
    /// Returns true if the run was known to the executor.
    async fn cancel(&self, run_id: &str) -> bool;

    /// Current occupancy.
    async fn stats(&self) -> PoolStats;

    /// Periodic housekeeping (idle reclaim, minimum top-up).
    async fn maintain(&self) {}

    /// Stop accepting work and release idle resources.
    async fn shutdown(&self) {}
}
