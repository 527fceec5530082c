// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run orchestrator.
//!
//! Owns the run state machine. `start_run` validates, persists a RUNNING row
//! and returns; execution happens on a background task that writes exactly one
//! terminal status through a compare-and-set against RUNNING. Cancellation
//! claims the terminal write first and then stops the worker, so whichever
//! side loses the race drops its outcome silently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::Persistence;
use cadence_core::persistence::{ListRunsFilter, NewRun, RunCompletion, RunRecord};
use cadence_core::status::{OriginKind, RunStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::registry::ActionRegistry;
use crate::runner::{Executor, LaunchOptions, RunOutcome};

/// Error recorded on runs found RUNNING at startup.
pub const ORPHANED_RUN_ERROR: &str = "orchestrator restarted while run was in progress";

/// Who asked for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOrigin {
    /// Direct API call.
    Api,
    /// Fired by a schedule.
    Schedule {
        /// Owning schedule.
        schedule_id: String,
    },
    /// Fired by a trigger invocation.
    Trigger {
        /// Owning trigger.
        trigger_id: String,
    },
}

impl RunOrigin {
    fn parts(&self) -> (OriginKind, Option<String>) {
        match self {
            Self::Api => (OriginKind::Api, None),
            Self::Schedule { schedule_id } => (OriginKind::Schedule, Some(schedule_id.clone())),
            Self::Trigger { trigger_id } => (OriginKind::Trigger, Some(trigger_id.clone())),
        }
    }
}

/// Request to start a run.
#[derive(Debug, Clone)]
pub struct StartRunRequest {
    /// Action to execute.
    pub action_id: String,
    /// Input, validated against the action's schema.
    pub input: Value,
    /// Caller.
    pub origin: RunOrigin,
    /// Optional correlation key, usable for cancellation.
    pub request_id: Option<String>,
    /// Optional time limit, capped by the pool ceiling.
    pub timeout: Option<Duration>,
}

impl StartRunRequest {
    /// API-originated run with no request id or timeout.
    pub fn api(action_id: impl Into<String>, input: Value) -> Self {
        Self {
            action_id: action_id.into(),
            input,
            origin: RunOrigin::Api,
            request_id: None,
            timeout: None,
        }
    }
}

/// Request to cancel a run by id or by request id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelRunRequest {
    /// Run to cancel.
    pub run_id: Option<String>,
    /// Alternative lookup by correlation key.
    pub request_id: Option<String>,
    /// Error message recorded on the run.
    pub reason: Option<String>,
}

impl CancelRunRequest {
    /// Cancel by run id.
    pub fn by_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: Some(run_id.into()),
            ..Self::default()
        }
    }
}

/// The run state machine.
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    registry: Arc<dyn ActionRegistry>,
    executor: Arc<dyn Executor>,
    events: Arc<EventBus>,
    data_dir: PathBuf,
    tasks: TaskTracker,
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Orchestrator {
    /// Create an orchestrator. Artifacts go under `data_dir/runs/<run_id>`.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        registry: Arc<dyn ActionRegistry>,
        executor: Arc<dyn Executor>,
        events: Arc<EventBus>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            persistence,
            registry,
            executor,
            events,
            data_dir: data_dir.into(),
            tasks: TaskTracker::new(),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shared event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Executor running the actions.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Validate, persist a RUNNING run and dispatch it. Returns as soon as the
    /// row is written.
    pub async fn start_run(&self, request: StartRunRequest) -> Result<RunRecord> {
        let resolved = self
            .registry
            .resolve_action(&request.action_id)
            .await?
            .ok_or_else(|| Error::not_found("action", &request.action_id))?;

        if !resolved.enabled {
            return Err(Error::Validation(format!(
                "action '{}' is disabled",
                request.action_id
            )));
        }
        resolved.validate_input(&request.input)?;

        let run_id = Uuid::new_v4().to_string();
        let relative_dir = Path::new("runs").join(&run_id);
        let artifacts_dir = self.data_dir.join(&relative_dir);
        tokio::fs::create_dir_all(&artifacts_dir).await?;

        // Registered before the row exists, so a cancel never misses it.
        let cancel = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(run_id.clone(), cancel.clone());

        let (origin_kind, origin_id) = request.origin.parts();
        let inserted = self
            .persistence
            .insert_run(&NewRun {
                id: run_id.clone(),
                action_id: request.action_id.clone(),
                status: RunStatus::Running,
                origin_kind,
                origin_id,
                request_id: request.request_id.clone(),
                input: request.input.clone(),
                artifacts_dir: Some(relative_dir.to_string_lossy().into_owned()),
                started_at: Some(Utc::now()),
            })
            .await;
        let record = match inserted {
            Ok(record) => record,
            Err(e) => {
                self.cancellations.lock().await.remove(&run_id);
                return Err(e.into());
            }
        };

        info!(
            run_id = %record.id,
            numbered_id = record.numbered_id,
            action_id = %record.action_id,
            origin = %origin_kind,
            "Run started"
        );
        self.events.record_run(&record).await;

        if cancel.is_cancelled() {
            self.cancellations.lock().await.remove(&run_id);
            debug!(run_id = %run_id, "Run cancelled before dispatch");
            return Ok(record);
        }
        self.dispatch(LaunchOptions {
            run_id,
            action: resolved.action,
            input: request.input,
            artifacts_dir,
            timeout: request.timeout,
            cancel,
        });

        Ok(record)
    }

    fn dispatch(&self, options: LaunchOptions) {
        let persistence = self.persistence.clone();
        let executor = self.executor.clone();
        let events = self.events.clone();
        let cancellations = self.cancellations.clone();

        self.tasks.spawn(async move {
            let run_id = options.run_id.clone();
            let artifacts_dir = options.artifacts_dir.clone();
            let outcome = executor.execute(options).await;
            cancellations.lock().await.remove(&run_id);

            write_output_log(&artifacts_dir, &outcome).await;

            let completion = RunCompletion {
                run_id: run_id.clone(),
                status: outcome.status,
                result: outcome.result,
                error: outcome.error,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code.map(i64::from),
                finished_at: Utc::now(),
            };

            match persistence.complete_run_if_running(&completion).await {
                Ok(true) => {
                    info!(
                        run_id = %run_id,
                        status = %completion.status,
                        duration_ms = outcome.duration_ms,
                        "Run finished"
                    );
                    publish_current(&*persistence, &events, &run_id).await;
                }
                Ok(false) => {
                    debug!(run_id = %run_id, status = %completion.status, "Run already terminal, dropping outcome");
                }
                Err(e) => {
                    error!(run_id = %run_id, error = %e, "Failed to record run outcome");
                }
            }
        });
    }

    /// Cancel a RUNNING run. Returns false when the run is already terminal or
    /// another caller won the race.
    pub async fn cancel_run(&self, request: CancelRunRequest) -> Result<bool> {
        let run = match (&request.run_id, &request.request_id) {
            (Some(run_id), _) => self
                .persistence
                .get_run(run_id)
                .await?
                .ok_or_else(|| Error::not_found("run", run_id))?,
            (None, Some(request_id)) => self
                .persistence
                .get_run_by_request_id(request_id)
                .await?
                .ok_or_else(|| Error::not_found("run", request_id))?,
            (None, None) => {
                return Err(Error::Validation(
                    "cancel requires a run_id or a request_id".to_string(),
                ));
            }
        };

        if run.status.is_terminal() {
            debug!(run_id = %run.id, status = %run.status, "Cancel ignored for terminal run");
            return Ok(false);
        }

        let completion = RunCompletion {
            run_id: run.id.clone(),
            status: RunStatus::Cancelled,
            result: None,
            error: Some(
                request
                    .reason
                    .unwrap_or_else(|| "cancelled by user".to_string()),
            ),
            stdout: None,
            stderr: None,
            exit_code: None,
            finished_at: Utc::now(),
        };

        if !self.persistence.complete_run_if_running(&completion).await? {
            return Ok(false);
        }

        let token = self.cancellations.lock().await.get(&run.id).cloned();
        let signalled = match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => self.executor.cancel(&run.id).await,
        };
        info!(run_id = %run.id, signalled, "Run cancelled");
        publish_current(&*self.persistence, &self.events, &run.id).await;
        Ok(true)
    }

    /// Look up a run.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.persistence.get_run(run_id).await?)
    }

    /// List runs, newest first.
    pub async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>> {
        Ok(self.persistence.list_runs(filter).await?)
    }

    /// Fail runs left RUNNING by a previous process. Call before dispatching
    /// anything.
    pub async fn recover_orphaned_runs(&self) -> Result<usize> {
        let running = self
            .persistence
            .list_runs(&ListRunsFilter {
                status: Some(RunStatus::Running),
                limit: Some(i64::MAX),
                ..ListRunsFilter::default()
            })
            .await?;

        let mut recovered = 0;
        for run in running {
            let completion = RunCompletion {
                run_id: run.id.clone(),
                status: RunStatus::Failed,
                result: None,
                error: Some(ORPHANED_RUN_ERROR.to_string()),
                stdout: None,
                stderr: None,
                exit_code: None,
                finished_at: Utc::now(),
            };
            if self.persistence.complete_run_if_running(&completion).await? {
                warn!(run_id = %run.id, "Failed orphaned run");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Wait for every dispatched run task to finish.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Number of run tasks still executing.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

async fn publish_current(persistence: &dyn Persistence, events: &EventBus, run_id: &str) {
    match persistence.get_run(run_id).await {
        Ok(Some(run)) => events.record_run(&run).await,
        Ok(None) => warn!(run_id = %run_id, "Run vanished before publishing"),
        Err(e) => warn!(run_id = %run_id, error = %e, "Failed to reload run for publishing"),
    }
}

async fn write_output_log(artifacts_dir: &Path, outcome: &RunOutcome) {
    if outcome.stdout.is_none() && outcome.stderr.is_none() {
        return;
    }
    let mut log = String::new();
    if let Some(stdout) = &outcome.stdout {
        log.push_str(stdout);
        if !stdout.ends_with('\n') {
            log.push('\n');
        }
    }
    if let Some(stderr) = &outcome.stderr {
        log.push_str("--- stderr ---\n");
        log.push_str(stderr);
        log.push('\n');
    }
    if let Err(e) = tokio::fs::write(artifacts_dir.join("output.log"), log).await {
        warn!(dir = %artifacts_dir.display(), error = %e, "Failed to write output.log");
    }
}
