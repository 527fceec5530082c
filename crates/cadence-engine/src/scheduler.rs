// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler engine.
//!
//! Evaluated on a fixed tick. Each tick runs three phases in order:
//!
//! 1. **Reconcile** every TRIGGERED/RUNNING execution against its run:
//!    record completions, cancel runs past `timeout_seconds`, and move failed
//!    attempts to RETRYING when the retry policy allows.
//! 2. **Retry** every RETRYING execution whose `retry_at` has passed by
//!    creating a new execution row with the next attempt number.
//! 3. **Fire** every enabled schedule whose `next_run_at` has passed, unless a
//!    dependency, concurrency or rate limit blocks it (first reason wins).
//!
//! Nothing is cached between ticks. A restarted engine continues from the
//! persisted rows alone.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::Persistence;
use cadence_core::persistence::{RunRecord, ScheduleExecutionRecord, ScheduleRecord};
use cadence_core::status::{DependencyMode, ExecutionStatus, OriginKind, RunStatus, ScheduleType};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::notifier::Notifier;
use crate::orchestrator::{CancelRunRequest, Orchestrator, RunOrigin, StartRunRequest};
use crate::timing;

/// Skip reason: predecessor has not reached the required outcome.
pub const SKIP_DEPENDENCY_NOT_MET: &str = "dependency_not_met";
/// Skip reason: `skip_if_running` or `max_concurrent` reached.
pub const SKIP_CONCURRENCY_LIMIT: &str = "concurrency_limit";
/// Skip reason: hourly or daily cap reached.
pub const SKIP_RATE_LIMITED: &str = "rate_limited";

/// Error code: run exceeded `timeout_seconds`.
pub const ERROR_TIMEOUT: &str = "timeout";
/// Error code: run was cancelled by a user.
pub const ERROR_CANCELLED: &str = "cancelled";
/// Error code: run finished FAILED.
pub const ERROR_RUN_FAILED: &str = "run_failed";
/// Error code: the orchestrator refused to start the run.
pub const ERROR_START_FAILED: &str = "start_failed";
/// Error code: timing parameters cannot be evaluated.
pub const ERROR_INVALID_SCHEDULE: &str = "invalid_schedule";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Time between ticks.
    pub tick: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Schedules fired.
    pub fired: usize,
    /// Schedules skipped.
    pub skipped: usize,
    /// Retry attempts started.
    pub retried: usize,
    /// Executions finished (completed, failed or moved to RETRYING).
    pub finished: usize,
    /// Runs cancelled for exceeding their timeout.
    pub timed_out: usize,
    /// Items that failed and were left for the next tick.
    pub errors: usize,
}

/// Largest accepted `backoff_multiplier`.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Retry delay before attempt `attempt + 1`:
/// `delay_seconds * multiplier^(attempt - 1)`, capped at
/// [`timing::MAX_DURATION_SECONDS`].
pub fn retry_delay(delay_seconds: i64, multiplier: f64, attempt: i64) -> chrono::Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, i64::from(i32::MAX)) as i32;
    let secs = delay_seconds.max(0) as f64 * multiplier.max(1.0).powi(exponent);
    let secs = secs.min(timing::MAX_DURATION_SECONDS as f64);
    chrono::Duration::milliseconds((secs * 1000.0).round() as i64)
}

/// The scheduler engine.
pub struct Scheduler {
    persistence: Arc<dyn Persistence>,
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<dyn Notifier>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a scheduler.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        orchestrator: Arc<Orchestrator>,
        notifier: Arc<dyn Notifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            orchestrator,
            notifier,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tick until shutdown is signalled.
    pub async fn run(&self) {
        info!(tick_ms = self.config.tick.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.tick) => {
                    match self.tick(Utc::now()).await {
                        Ok(report) if report != TickReport::default() => {
                            debug!(?report, "Scheduler tick");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Scheduler tick failed"),
                    }
                }
            }
        }
    }

    /// Run one evaluation at `now`.
    ///
    /// Only store failures on the top-level queries abort the tick; failures
    /// of one schedule or execution are logged and counted.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();
        self.reconcile(now, &mut report).await?;
        self.fire_due_retries(now, &mut report).await?;
        self.fire_due_schedules(now, &mut report).await?;
        Ok(report)
    }

    // -------------------------------------------------------------- reconcile

    async fn reconcile(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        for execution in self.persistence.list_active_executions().await? {
            let execution_id = execution.id.clone();
            if let Err(e) = self.reconcile_one(execution, now, report).await {
                error!(execution_id = %execution_id, error = %e, "Failed to reconcile execution");
                report.errors += 1;
            }
        }
        Ok(())
    }

    async fn reconcile_one(
        &self,
        mut execution: ScheduleExecutionRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let Some(schedule) = self.persistence.get_schedule(&execution.schedule_id).await? else {
            return Ok(());
        };

        let Some(run_id) = execution.run_id.clone() else {
            // Engine stopped between recording the attempt and starting its run.
            execution.error_code = Some(ERROR_START_FAILED.to_string());
            execution.error_message = Some("run was never started".to_string());
            self.finish_attempt(&schedule, execution, ExecutionStatus::Failed, false, now)
                .await?;
            report.finished += 1;
            return Ok(());
        };

        let Some(run) = self.persistence.get_run(&run_id).await? else {
            execution.error_code = Some(ERROR_RUN_FAILED.to_string());
            execution.error_message = Some(format!("run {} not found", run_id));
            self.finish_attempt(&schedule, execution, ExecutionStatus::Failed, false, now)
                .await?;
            report.finished += 1;
            return Ok(());
        };

        execution.duration_seconds = run.duration_seconds;
        match run.status {
            RunStatus::Running | RunStatus::NotRun => {
                if !self.is_timed_out(&schedule, &run, now) {
                    return Ok(());
                }
                let limit = schedule.timeout_seconds.unwrap_or_default();
                let cancelled = self
                    .orchestrator
                    .cancel_run(CancelRunRequest {
                        run_id: Some(run.id.clone()),
                        request_id: None,
                        reason: Some(format!("timed out after {}s", limit)),
                    })
                    .await?;
                if !cancelled {
                    // Finished on its own in the meantime; next tick records it.
                    return Ok(());
                }
                warn!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    timeout_seconds = limit,
                    "Schedule run timed out, cancelled"
                );
                if let Some(run) = self.persistence.get_run(&run.id).await? {
                    execution.duration_seconds = run.duration_seconds;
                }
                execution.error_code = Some(ERROR_TIMEOUT.to_string());
                execution.error_message = Some(format!("run exceeded {}s", limit));
                self.finish_attempt(&schedule, execution, ExecutionStatus::Failed, true, now)
                    .await?;
                report.timed_out += 1;
                report.finished += 1;
            }
            RunStatus::Passed => {
                self.finish_attempt(&schedule, execution, ExecutionStatus::Completed, false, now)
                    .await?;
                report.finished += 1;
            }
            RunStatus::Failed => {
                execution.error_code = Some(ERROR_RUN_FAILED.to_string());
                execution.error_message = run.error.clone();
                self.finish_attempt(&schedule, execution, ExecutionStatus::Failed, true, now)
                    .await?;
                report.finished += 1;
            }
            RunStatus::Cancelled => {
                execution.error_code = Some(ERROR_CANCELLED.to_string());
                execution.error_message = run.error.clone();
                self.finish_attempt(&schedule, execution, ExecutionStatus::Failed, false, now)
                    .await?;
                report.finished += 1;
            }
        }
        Ok(())
    }

    fn is_timed_out(&self, schedule: &ScheduleRecord, run: &RunRecord, now: DateTime<Utc>) -> bool {
        match (schedule.timeout_seconds, run.started_at) {
            (Some(limit), Some(started)) if limit > 0 => chrono::Duration::try_seconds(limit)
                .is_some_and(|limit| now - started >= limit),
            _ => false,
        }
    }

    /// Write the final state of an attempt. Failed attempts become RETRYING
    /// when `retryable` and the policy has attempts left.
    async fn finish_attempt(
        &self,
        schedule: &ScheduleRecord,
        mut execution: ScheduleExecutionRecord,
        status: ExecutionStatus,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        execution.finished_at = Some(now);
        if execution.duration_seconds.is_none()
            && let Some(started) = execution.started_at
        {
            execution.duration_seconds = Some((now - started).num_milliseconds() as f64 / 1000.0);
        }

        let will_retry = status == ExecutionStatus::Failed
            && retryable
            && schedule.retry_enabled
            && execution.attempt < schedule.retry_max_attempts;
        let delay = retry_delay(
            schedule.retry_delay_seconds,
            schedule.backoff_multiplier,
            execution.attempt,
        );
        let retry_at = will_retry
            .then(|| now.checked_add_signed(delay))
            .flatten();
        if will_retry && retry_at.is_none() {
            warn!(schedule_id = %schedule.id, "Retry time out of range, not retrying");
        }

        if let Some(retry_at) = retry_at {
            execution.status = ExecutionStatus::Retrying;
            execution.retry_at = Some(retry_at);
            info!(
                schedule_id = %schedule.id,
                execution_id = %execution.id,
                attempt = execution.attempt,
                retry_in_ms = delay.num_milliseconds(),
                "Schedule attempt failed, retry pending"
            );
        } else {
            execution.status = status;
            let notify = match status {
                ExecutionStatus::Completed => schedule.notify_on_success,
                _ => schedule.notify_on_failure,
            };
            if notify {
                execution.notification_sent = self.send_notifications(schedule, &execution).await;
            }
            info!(
                schedule_id = %schedule.id,
                execution_id = %execution.id,
                attempt = execution.attempt,
                status = %execution.status,
                error_code = ?execution.error_code,
                "Schedule attempt finished"
            );
        }

        self.persistence.update_execution(&execution).await?;
        Ok(())
    }

    async fn send_notifications(
        &self,
        schedule: &ScheduleRecord,
        execution: &ScheduleExecutionRecord,
    ) -> bool {
        let mut sent = false;
        for channel in schedule.notification_channels.0.iter() {
            match self.notifier.notify(channel, schedule, execution).await {
                Ok(()) => sent = true,
                Err(e) => warn!(
                    schedule_id = %schedule.id,
                    channel = %channel,
                    error = %e,
                    "Failed to send notification"
                ),
            }
        }
        sent
    }

    // ---------------------------------------------------------------- retries

    async fn fire_due_retries(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        for execution in self.persistence.list_due_retries(now).await? {
            let execution_id = execution.id.clone();
            match self.retry_one(execution, now).await {
                Ok(true) => report.retried += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(execution_id = %execution_id, error = %e, "Failed to start retry");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Start the next attempt of a RETRYING execution. A retry blocked by the
    /// concurrency limit stays RETRYING and is tried again next tick.
    async fn retry_one(&self, mut previous: ScheduleExecutionRecord, now: DateTime<Utc>) -> Result<bool> {
        let schedule = self.persistence.get_schedule(&previous.schedule_id).await?;
        let due_at = previous.retry_at.unwrap_or(now);

        let Some(schedule) = schedule.filter(|s| s.enabled) else {
            debug!(execution_id = %previous.id, "Schedule gone or disabled, dropping retry");
            previous.status = ExecutionStatus::Failed;
            self.persistence.update_execution(&previous).await?;
            return Ok(false);
        };
        if self.at_concurrency_limit(&schedule).await? {
            debug!(
                schedule_id = %schedule.id,
                execution_id = %previous.id,
                "Retry held back by concurrency limit"
            );
            return Ok(false);
        }

        // The earlier attempt is final once its successor exists.
        previous.status = ExecutionStatus::Failed;
        self.persistence.update_execution(&previous).await?;

        let attempt = ScheduleExecutionRecord::new(
            &schedule.id,
            ExecutionStatus::Triggered,
            previous.attempt + 1,
            due_at,
            now,
        );
        info!(
            schedule_id = %schedule.id,
            attempt = attempt.attempt,
            "Retrying schedule"
        );
        self.launch(&schedule, attempt, now).await?;
        Ok(true)
    }

    // --------------------------------------------------------------- firing

    async fn fire_due_schedules(&self, now: DateTime<Utc>, report: &mut TickReport) -> Result<()> {
        for schedule in self.persistence.list_due_schedules(now).await? {
            let schedule_id = schedule.id.clone();
            if let Err(e) = self.evaluate(schedule, now, report).await {
                error!(schedule_id = %schedule_id, error = %e, "Failed to evaluate schedule");
                report.errors += 1;
            }
        }
        Ok(())
    }

    async fn evaluate(
        &self,
        schedule: ScheduleRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        let scheduled_at = schedule.next_run_at.unwrap_or(now);

        let next_run_at = match timing::next_fire(&schedule, now) {
            Ok(next) => next,
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Invalid schedule timing, parking schedule");
                let mut execution = ScheduleExecutionRecord::new(
                    &schedule.id,
                    ExecutionStatus::Failed,
                    1,
                    scheduled_at,
                    now,
                );
                execution.error_code = Some(ERROR_INVALID_SCHEDULE.to_string());
                execution.error_message = Some(e.to_string());
                execution.finished_at = Some(now);
                self.persistence.insert_execution(&execution).await?;
                self.persistence
                    .update_schedule_timing(&schedule.id, None, None, schedule.enabled)
                    .await?;
                report.errors += 1;
                return Ok(());
            }
        };
        // A one-shot schedule's slot is consumed whether it fires or skips.
        let still_enabled = schedule.schedule_type != ScheduleType::Once;

        if let Some(reason) = self.blocking_reason(&schedule, now).await? {
            info!(schedule_id = %schedule.id, skip_reason = reason, "Skipping schedule");
            let mut execution = ScheduleExecutionRecord::new(
                &schedule.id,
                ExecutionStatus::Skipped,
                1,
                scheduled_at,
                now,
            );
            execution.skip_reason = Some(reason.to_string());
            execution.finished_at = Some(now);
            self.persistence.insert_execution(&execution).await?;
            self.persistence
                .update_schedule_timing(&schedule.id, None, next_run_at, still_enabled)
                .await?;
            report.skipped += 1;
            return Ok(());
        }

        let execution = ScheduleExecutionRecord::new(
            &schedule.id,
            ExecutionStatus::Triggered,
            1,
            scheduled_at,
            now,
        );
        self.launch(&schedule, execution, now).await?;
        self.persistence
            .update_schedule_timing(&schedule.id, Some(now), next_run_at, still_enabled)
            .await?;
        report.fired += 1;
        Ok(())
    }

    async fn blocking_reason(
        &self,
        schedule: &ScheduleRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<&'static str>> {
        if let Some(predecessor) = &schedule.depends_on_schedule_id {
            let latest = self.persistence.latest_execution(predecessor).await?;
            let satisfied = match (schedule.dependency_mode, latest.map(|e| e.status)) {
                (DependencyMode::AfterSuccess, Some(ExecutionStatus::Completed)) => true,
                (
                    DependencyMode::AfterAny,
                    Some(ExecutionStatus::Completed | ExecutionStatus::Failed),
                ) => true,
                _ => false,
            };
            if !satisfied {
                return Ok(Some(SKIP_DEPENDENCY_NOT_MET));
            }
        }

        if self.at_concurrency_limit(schedule).await? {
            return Ok(Some(SKIP_CONCURRENCY_LIMIT));
        }

        let windows = [
            (schedule.rate_limit_per_hour, chrono::Duration::hours(1)),
            (schedule.rate_limit_per_day, chrono::Duration::days(1)),
        ];
        for (cap, window) in windows {
            let Some(cap) = cap else { continue };
            let fired = self
                .persistence
                .count_fired_executions_since(&schedule.id, now - window)
                .await?;
            if fired >= cap {
                return Ok(Some(SKIP_RATE_LIMITED));
            }
        }

        Ok(None)
    }

    /// Whether another run would break `skip_if_running` or `max_concurrent`.
    async fn at_concurrency_limit(&self, schedule: &ScheduleRecord) -> Result<bool> {
        let running = self
            .persistence
            .count_running_runs(OriginKind::Schedule, &schedule.id)
            .await?;
        Ok((schedule.skip_if_running && running > 0) || running >= schedule.max_concurrent.max(1))
    }

    /// Record an attempt and start its run. A start failure finishes the
    /// attempt as FAILED with `start_failed`.
    async fn launch(
        &self,
        schedule: &ScheduleRecord,
        mut execution: ScheduleExecutionRecord,
        now: DateTime<Utc>,
    ) -> Result<ScheduleExecutionRecord> {
        execution.status = ExecutionStatus::Triggered;
        self.persistence.insert_execution(&execution).await?;

        let request = StartRunRequest {
            action_id: schedule.action_id.clone(),
            input: schedule.inputs.0.clone(),
            origin: RunOrigin::Schedule {
                schedule_id: schedule.id.clone(),
            },
            request_id: None,
            timeout: None,
        };

        match self.orchestrator.start_run(request).await {
            Ok(run) => {
                execution.run_id = Some(run.id.clone());
                execution.status = ExecutionStatus::Running;
                execution.started_at = run.started_at.or(Some(now));
                self.persistence.update_execution(&execution).await?;
                info!(
                    schedule_id = %schedule.id,
                    run_id = %run.id,
                    attempt = execution.attempt,
                    "Schedule fired"
                );
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Failed to start schedule run");
                execution.error_code = Some(ERROR_START_FAILED.to_string());
                execution.error_message = Some(e.to_string());
                self.finish_attempt(schedule, execution.clone(), ExecutionStatus::Failed, false, now)
                    .await?;
                execution.status = ExecutionStatus::Failed;
            }
        }
        Ok(execution)
    }

    /// Fire a schedule immediately, bypassing timing, dependency and rate
    /// limits. The concurrency limit still applies and fails the call with
    /// [`Error::InvalidState`]. `next_run_at` is left untouched.
    pub async fn fire_now(
        &self,
        schedule: &ScheduleRecord,
        now: DateTime<Utc>,
    ) -> Result<ScheduleExecutionRecord> {
        if self.at_concurrency_limit(schedule).await? {
            return Err(Error::InvalidState(format!(
                "schedule '{}' is at its concurrency limit",
                schedule.id
            )));
        }
        let execution =
            ScheduleExecutionRecord::new(&schedule.id, ExecutionStatus::Triggered, 1, now, now);
        let execution = self.launch(schedule, execution, now).await?;
        self.persistence
            .update_schedule_timing(&schedule.id, Some(now), schedule.next_run_at, schedule.enabled)
            .await?;
        Ok(execution)
    }
}
