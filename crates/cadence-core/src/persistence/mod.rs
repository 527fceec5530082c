// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for cadence-core.
//!
//! This module defines the record types, the [`Persistence`] abstraction and
//! the SQLite backend. Every JSON-typed column is stored as TEXT and decoded
//! through [`sqlx::types::Json`].

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
pub use sqlx::types::Json;

use crate::error::CoreError;
use crate::status::{
    DependencyMode, ExecutionStatus, InvocationStatus, OriginKind, RunStatus, ScheduleType,
    TriggerType,
};

/// Action record. Imported by the package collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActionRecord {
    /// Unique action identifier.
    pub id: String,
    /// Package the action was imported from.
    pub package_id: String,
    /// Human-readable action name.
    pub name: String,
    /// Opaque entry point handed to the worker process.
    pub entry_point: String,
    /// JSON Schema for the run input.
    pub input_schema: Option<Json<Value>>,
    /// JSON Schema for the run result.
    pub output_schema: Option<Json<Value>>,
    /// Disabled actions cannot be started.
    pub enabled: bool,
    /// When the action was imported.
    pub created_at: DateTime<Utc>,
}

/// Run record from the persistence layer.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunRecord {
    /// Unique identifier for the run.
    pub id: String,
    /// Monotonically increasing, human-friendly run number.
    pub numbered_id: i64,
    /// Action this run executes.
    pub action_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Who started the run.
    pub origin_kind: OriginKind,
    /// Schedule or trigger id, when not an API call.
    pub origin_id: Option<String>,
    /// Caller-supplied idempotency / correlation key.
    pub request_id: Option<String>,
    /// Input passed to the action.
    pub input: Json<Value>,
    /// Result reported by a passing action.
    pub result: Option<Json<Value>>,
    /// Error message for failed and cancelled runs.
    pub error: Option<String>,
    /// Captured worker stdout.
    pub stdout: Option<String>,
    /// Captured worker stderr.
    pub stderr: Option<String>,
    /// Worker exit status, if the worker exited.
    pub exit_code: Option<i64>,
    /// Artifact directory, relative to the data dir.
    pub artifacts_dir: Option<String>,
    /// When the run was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds.
    pub duration_seconds: Option<f64>,
    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a run. `numbered_id` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Unique identifier for the run.
    pub id: String,
    /// Action this run executes.
    pub action_id: String,
    /// Initial status, RUNNING for every dispatched run.
    pub status: RunStatus,
    /// Who started the run.
    pub origin_kind: OriginKind,
    /// Origin record id.
    pub origin_id: Option<String>,
    /// Correlation key.
    pub request_id: Option<String>,
    /// Input passed to the action.
    pub input: Value,
    /// Artifact directory, relative to the data dir.
    pub artifacts_dir: Option<String>,
    /// Dispatch time.
    pub started_at: Option<DateTime<Utc>>,
}

/// Terminal write for a run.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    /// Run to complete.
    pub run_id: String,
    /// PASSED, FAILED or CANCELLED.
    pub status: RunStatus,
    /// Result for passing runs.
    pub result: Option<Value>,
    /// Error message.
    pub error: Option<String>,
    /// Captured stdout.
    pub stdout: Option<String>,
    /// Captured stderr.
    pub stderr: Option<String>,
    /// Worker exit status.
    pub exit_code: Option<i64>,
    /// Completion time.
    pub finished_at: DateTime<Utc>,
}

/// Filter options for listing runs.
#[derive(Debug, Clone, Default)]
pub struct ListRunsFilter {
    /// Only runs with this status.
    pub status: Option<RunStatus>,
    /// Only runs with this origin kind.
    pub origin_kind: Option<OriginKind>,
    /// Only runs with this origin id.
    pub origin_id: Option<String>,
    /// Only runs of this action.
    pub action_id: Option<String>,
    /// Maximum rows (newest first). Defaults to 100.
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: Option<i64>,
}

/// Schedule record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduleRecord {
    /// Unique schedule identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Action started on each fire.
    pub action_id: String,
    /// Input passed to each run.
    pub inputs: Json<Value>,
    /// Timing kind.
    pub schedule_type: ScheduleType,
    /// Cron expression (cron schedules).
    pub cron_expression: Option<String>,
    /// Seconds between fires (interval schedules).
    pub interval_seconds: Option<i64>,
    /// Weekday names, `mon`..`sun` (weekday schedules).
    pub weekdays: Option<Json<Vec<String>>>,
    /// Times of day as `HH:MM` (weekday schedules).
    pub weekday_times: Option<Json<Vec<String>>>,
    /// Fire time (once schedules).
    pub run_once_at: Option<DateTime<Utc>>,
    /// IANA timezone name for cron and weekday timing.
    pub timezone: String,
    /// Disabled schedules are never evaluated.
    pub enabled: bool,
    /// Last time a run was fired.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Next due time. NULL while disabled or when timing is invalid.
    pub next_run_at: Option<DateTime<Utc>>,
    /// Skip a fire while any run of this schedule is RUNNING.
    pub skip_if_running: bool,
    /// Maximum concurrently RUNNING runs.
    pub max_concurrent: i64,
    /// Cancel a run that has been RUNNING longer than this.
    pub timeout_seconds: Option<i64>,
    /// Whether failed attempts are retried.
    pub retry_enabled: bool,
    /// Total attempts including the first.
    pub retry_max_attempts: i64,
    /// Base delay before the first retry.
    pub retry_delay_seconds: i64,
    /// Delay multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Maximum fires in the trailing hour.
    pub rate_limit_per_hour: Option<i64>,
    /// Maximum fires in the trailing day.
    pub rate_limit_per_day: Option<i64>,
    /// Predecessor schedule.
    pub depends_on_schedule_id: Option<String>,
    /// Which predecessor outcomes satisfy the dependency.
    pub dependency_mode: DependencyMode,
    /// Notify when an execution completes.
    pub notify_on_success: bool,
    /// Notify when an execution fails for good.
    pub notify_on_failure: bool,
    /// Channels such as `webhook:<url>` or `email:<addr>`.
    pub notification_channels: Json<Vec<String>>,
    /// Higher priority schedules are evaluated first within a tick.
    pub priority: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last edit time.
    pub updated_at: DateTime<Utc>,
}

/// One attempt of a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduleExecutionRecord {
    /// Unique execution identifier.
    pub id: String,
    /// Owning schedule.
    pub schedule_id: String,
    /// Run created for this attempt.
    pub run_id: Option<String>,
    /// Current status.
    pub status: ExecutionStatus,
    /// 1 for the first attempt, incremented per retry.
    pub attempt: i64,
    /// When the attempt was due.
    pub scheduled_at: DateTime<Utc>,
    /// When the run actually started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Run duration in seconds.
    pub duration_seconds: Option<f64>,
    /// Machine-readable failure code (`timeout`, `cancelled`, ...).
    pub error_code: Option<String>,
    /// Failure message.
    pub error_message: Option<String>,
    /// Why the attempt was SKIPPED.
    pub skip_reason: Option<String>,
    /// When the next attempt fires (RETRYING only).
    pub retry_at: Option<DateTime<Utc>>,
    /// Whether a notification was sent for this attempt.
    pub notification_sent: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ScheduleExecutionRecord {
    /// Fresh attempt row with the given status.
    pub fn new(
        schedule_id: &str,
        status: ExecutionStatus,
        attempt: i64,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            schedule_id: schedule_id.to_string(),
            run_id: None,
            status,
            attempt,
            scheduled_at,
            started_at: None,
            finished_at: None,
            duration_seconds: None,
            error_code: None,
            error_message: None,
            skip_reason: None,
            retry_at: None,
            notification_sent: false,
            created_at: now,
        }
    }
}

/// Aggregate execution counters for schedule stats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCounts {
    /// FAILED executions finished since the 24h cut-off.
    pub failed_last_24h: i64,
    /// COMPLETED executions finished since the 7d cut-off.
    pub completed_last_7d: i64,
    /// FAILED executions finished since the 7d cut-off.
    pub failed_last_7d: i64,
    /// Executions currently TRIGGERED or RUNNING.
    pub running: i64,
}

/// Trigger record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerRecord {
    /// Unique trigger identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Event source kind.
    pub trigger_type: TriggerType,
    /// Action started on acceptance.
    pub action_id: String,
    /// Base input; the payload is merged on top.
    pub inputs_template: Json<Value>,
    /// Disabled triggers reject every invocation.
    pub enabled: bool,
    /// Shared secret for webhooks.
    pub webhook_secret: Option<String>,
    /// Allowed HTTP method for webhooks.
    pub webhook_method: Option<String>,
    /// Sliding-window per-minute cap.
    pub rate_limit_max_per_minute: Option<i64>,
    /// Recipient address for email triggers.
    pub email_address: Option<String>,
    /// Directory watched by file-watch triggers.
    pub watch_path: Option<String>,
    /// Glob applied to file names.
    pub watch_pattern: Option<String>,
    /// Subset of `created`, `modified`, `removed`. Empty means all.
    pub watch_events: Json<Vec<String>>,
    /// Accepted invocations so far.
    pub invocation_count: i64,
    /// Last accepted invocation.
    pub last_invoked_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last edit time.
    pub updated_at: DateTime<Utc>,
}

/// Trigger invocation record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TriggerInvocationRecord {
    /// Unique invocation identifier.
    pub id: String,
    /// Trigger invoked.
    pub trigger_id: String,
    /// Outcome.
    pub status: InvocationStatus,
    /// Run started, for ACCEPTED invocations.
    pub run_id: Option<String>,
    /// Payload as received.
    pub payload: Option<Json<Value>>,
    /// Caller address.
    pub source_ip: Option<String>,
    /// Reason for REJECTED, RATE_LIMITED and ERROR.
    pub error_message: Option<String>,
    /// Invocation time.
    pub invoked_at: DateTime<Utc>,
}

/// Persistence interface used by the engine.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ---------------------------------------------------------------- actions

    /// Insert or replace an action definition.
    async fn import_action(&self, action: &ActionRecord) -> Result<(), CoreError>;

    async fn get_action(&self, action_id: &str) -> Result<Option<ActionRecord>, CoreError>;

    async fn list_actions(&self) -> Result<Vec<ActionRecord>, CoreError>;

    /// Returns false when the action does not exist.
    async fn set_action_enabled(&self, action_id: &str, enabled: bool)
    -> Result<bool, CoreError>;

    // ------------------------------------------------------------------- runs

    /// Insert a run, assigning the next `numbered_id`.
    async fn insert_run(&self, run: &NewRun) -> Result<RunRecord, CoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError>;

    /// Most recent run carrying this request id.
    async fn get_run_by_request_id(&self, request_id: &str)
    -> Result<Option<RunRecord>, CoreError>;

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError>;

    /// Write a terminal status only if the run is still RUNNING.
    ///
    /// Returns true if this call performed the transition. A second caller
    /// racing the same run gets false and must not publish anything.
    async fn complete_run_if_running(&self, completion: &RunCompletion)
    -> Result<bool, CoreError>;

    /// Count RUNNING runs with the given origin (kind + id).
    async fn count_running_runs(
        &self,
        origin_kind: OriginKind,
        origin_id: &str,
    ) -> Result<i64, CoreError>;

    // -------------------------------------------------------------- schedules

    async fn insert_schedule(&self, schedule: &ScheduleRecord) -> Result<(), CoreError>;

    /// Overwrite every editable column. Returns false when missing.
    async fn update_schedule(&self, schedule: &ScheduleRecord) -> Result<bool, CoreError>;

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleRecord>, CoreError>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, CoreError>;

    async fn delete_schedule(&self, schedule_id: &str) -> Result<bool, CoreError>;

    /// Enabled schedules with `next_run_at <= now`, highest priority first.
    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, CoreError>;

    /// Scheduler-owned fields: `last_run_at`, `next_run_at` and `enabled`.
    async fn update_schedule_timing(
        &self,
        schedule_id: &str,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<(), CoreError>;

    // ----------------------------------------------------- schedule executions

    async fn insert_execution(&self, execution: &ScheduleExecutionRecord)
    -> Result<(), CoreError>;

    /// Overwrite the mutable columns of an execution.
    async fn update_execution(&self, execution: &ScheduleExecutionRecord)
    -> Result<(), CoreError>;

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ScheduleExecutionRecord>, CoreError>;

    /// Newest-first executions of one schedule.
    async fn list_executions(
        &self,
        schedule_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScheduleExecutionRecord>, CoreError>;

    /// Most recent execution of any status, SKIPPED included.
    async fn latest_execution(
        &self,
        schedule_id: &str,
    ) -> Result<Option<ScheduleExecutionRecord>, CoreError>;

    /// Executions still TRIGGERED or RUNNING.
    async fn list_active_executions(&self) -> Result<Vec<ScheduleExecutionRecord>, CoreError>;

    /// RETRYING executions whose `retry_at <= now`.
    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleExecutionRecord>, CoreError>;

    /// Executions of the schedule that started a run at or after `since`.
    async fn count_fired_executions_since(
        &self,
        schedule_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    /// Counters over all schedules for stats.
    async fn execution_counts(
        &self,
        since_24h: DateTime<Utc>,
        since_7d: DateTime<Utc>,
    ) -> Result<ExecutionCounts, CoreError>;

    // --------------------------------------------------------------- triggers

    async fn insert_trigger(&self, trigger: &TriggerRecord) -> Result<(), CoreError>;

    async fn update_trigger(&self, trigger: &TriggerRecord) -> Result<bool, CoreError>;

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerRecord>, CoreError>;

    async fn list_triggers(&self) -> Result<Vec<TriggerRecord>, CoreError>;

    async fn delete_trigger(&self, trigger_id: &str) -> Result<bool, CoreError>;

    /// Store an invocation. ACCEPTED invocations also bump the trigger's
    /// `invocation_count` and `last_invoked_at` in the same transaction.
    async fn record_invocation(&self, invocation: &TriggerInvocationRecord)
    -> Result<(), CoreError>;

    /// Newest-first invocations of one trigger.
    async fn list_invocations(
        &self,
        trigger_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TriggerInvocationRecord>, CoreError>;
}
