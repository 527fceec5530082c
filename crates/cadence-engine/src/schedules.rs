// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule management: create, edit, enable, delete, inspect.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_core::Persistence;
use cadence_core::persistence::{Json, ScheduleExecutionRecord, ScheduleRecord};
use cadence_core::status::{DependencyMode, ScheduleType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::scheduler::{MAX_BACKOFF_MULTIPLIER, Scheduler};
use crate::timing::{self, MAX_DURATION_SECONDS};

fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

fn default_one() -> i64 {
    1
}

fn default_retry_delay() -> i64 {
    60
}

fn default_backoff() -> f64 {
    2.0
}

fn default_dependency_mode() -> DependencyMode {
    DependencyMode::AfterSuccess
}

/// Editable schedule fields, used for both create and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Action started on each fire.
    pub action_id: String,
    /// Input passed to each run.
    #[serde(default = "empty_object")]
    pub inputs: Value,
    /// Timing kind.
    pub schedule_type: ScheduleType,
    /// Cron expression.
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// Interval in seconds.
    #[serde(default)]
    pub interval_seconds: Option<i64>,
    /// Weekday names.
    #[serde(default)]
    pub weekdays: Option<Vec<String>>,
    /// Times of day as `HH:MM`.
    #[serde(default)]
    pub weekday_times: Option<Vec<String>>,
    /// One-shot fire time.
    #[serde(default)]
    pub run_once_at: Option<DateTime<Utc>>,
    /// IANA timezone.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Whether the schedule is evaluated.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Skip while a run of this schedule is RUNNING.
    #[serde(default)]
    pub skip_if_running: bool,
    /// Maximum concurrently RUNNING runs.
    #[serde(default = "default_one")]
    pub max_concurrent: i64,
    /// Cancel runs RUNNING longer than this.
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    /// Retry failed attempts.
    #[serde(default)]
    pub retry_enabled: bool,
    /// Total attempts including the first.
    #[serde(default = "default_one")]
    pub retry_max_attempts: i64,
    /// Base retry delay.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: i64,
    /// Delay multiplier per attempt.
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
    /// Maximum fires per trailing hour.
    #[serde(default)]
    pub rate_limit_per_hour: Option<i64>,
    /// Maximum fires per trailing day.
    #[serde(default)]
    pub rate_limit_per_day: Option<i64>,
    /// Predecessor schedule.
    #[serde(default)]
    pub depends_on_schedule_id: Option<String>,
    /// Which predecessor outcomes satisfy the dependency.
    #[serde(default = "default_dependency_mode")]
    pub dependency_mode: DependencyMode,
    /// Notify on success.
    #[serde(default)]
    pub notify_on_success: bool,
    /// Notify on final failure.
    #[serde(default)]
    pub notify_on_failure: bool,
    /// Notification channels.
    #[serde(default)]
    pub notification_channels: Vec<String>,
    /// Evaluation priority within a tick.
    #[serde(default)]
    pub priority: i64,
}

impl ScheduleSpec {
    /// Required fields only; everything else at its default.
    pub fn new(
        name: impl Into<String>,
        action_id: impl Into<String>,
        schedule_type: ScheduleType,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            action_id: action_id.into(),
            inputs: empty_object(),
            schedule_type,
            cron_expression: None,
            interval_seconds: None,
            weekdays: None,
            weekday_times: None,
            run_once_at: None,
            timezone: default_timezone(),
            enabled: true,
            skip_if_running: false,
            max_concurrent: 1,
            timeout_seconds: None,
            retry_enabled: false,
            retry_max_attempts: 1,
            retry_delay_seconds: default_retry_delay(),
            backoff_multiplier: default_backoff(),
            rate_limit_per_hour: None,
            rate_limit_per_day: None,
            depends_on_schedule_id: None,
            dependency_mode: DependencyMode::AfterSuccess,
            notify_on_success: false,
            notify_on_failure: false,
            notification_channels: Vec::new(),
            priority: 0,
        }
    }

    fn into_record(self, id: String, created_at: DateTime<Utc>, now: DateTime<Utc>) -> ScheduleRecord {
        ScheduleRecord {
            id,
            name: self.name,
            description: self.description,
            action_id: self.action_id,
            inputs: Json(self.inputs),
            schedule_type: self.schedule_type,
            cron_expression: self.cron_expression,
            interval_seconds: self.interval_seconds,
            weekdays: self.weekdays.map(Json),
            weekday_times: self.weekday_times.map(Json),
            run_once_at: self.run_once_at,
            timezone: self.timezone,
            enabled: self.enabled,
            last_run_at: None,
            next_run_at: None,
            skip_if_running: self.skip_if_running,
            max_concurrent: self.max_concurrent,
            timeout_seconds: self.timeout_seconds,
            retry_enabled: self.retry_enabled,
            retry_max_attempts: self.retry_max_attempts,
            retry_delay_seconds: self.retry_delay_seconds,
            backoff_multiplier: self.backoff_multiplier,
            rate_limit_per_hour: self.rate_limit_per_hour,
            rate_limit_per_day: self.rate_limit_per_day,
            depends_on_schedule_id: self.depends_on_schedule_id,
            dependency_mode: self.dependency_mode,
            notify_on_success: self.notify_on_success,
            notify_on_failure: self.notify_on_failure,
            notification_channels: Json(self.notification_channels),
            priority: self.priority,
            created_at,
            updated_at: now,
        }
    }
}

/// Aggregate schedule statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStats {
    /// All schedules.
    pub total: usize,
    /// Enabled schedules.
    pub enabled: usize,
    /// Disabled schedules.
    pub disabled: usize,
    /// Executions TRIGGERED or RUNNING.
    pub running: i64,
    /// FAILED executions in the last 24 hours.
    pub failed_last_24h: i64,
    /// COMPLETED / (COMPLETED + FAILED) over the last 7 days, if any finished.
    pub success_rate_7d: Option<f64>,
}

/// Management operations on schedules.
pub struct ScheduleService {
    persistence: Arc<dyn Persistence>,
    scheduler: Arc<Scheduler>,
}

impl ScheduleService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            persistence,
            scheduler,
        }
    }

    /// Validate and store a new schedule.
    pub async fn create(&self, spec: ScheduleSpec) -> Result<ScheduleRecord> {
        let now = Utc::now();
        let mut record = spec.into_record(Uuid::new_v4().to_string(), now, now);
        self.validate(&record).await?;
        record.next_run_at = self.initial_next_run(&record, now)?;

        self.persistence.insert_schedule(&record).await?;
        info!(
            schedule_id = %record.id,
            name = %record.name,
            schedule_type = %record.schedule_type,
            next_run_at = ?record.next_run_at,
            "Schedule created"
        );
        Ok(record)
    }

    /// Replace the editable fields of a schedule. Timing is recomputed from
    /// `now`; `last_run_at` is kept.
    pub async fn update(&self, schedule_id: &str, spec: ScheduleSpec) -> Result<ScheduleRecord> {
        let existing = self.get(schedule_id).await?;
        let now = Utc::now();
        let mut record = spec.into_record(existing.id.clone(), existing.created_at, now);
        record.last_run_at = existing.last_run_at;
        self.validate(&record).await?;
        record.next_run_at = self.initial_next_run(&record, now)?;

        if !self.persistence.update_schedule(&record).await? {
            return Err(Error::not_found("schedule", schedule_id));
        }
        info!(schedule_id = %record.id, next_run_at = ?record.next_run_at, "Schedule updated");
        Ok(record)
    }

    /// Enable or disable a schedule. Enabling recomputes `next_run_at`;
    /// disabling clears it.
    pub async fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<ScheduleRecord> {
        let mut record = self.get(schedule_id).await?;
        record.enabled = enabled;
        record.next_run_at = self.initial_next_run(&record, Utc::now())?;
        self.persistence
            .update_schedule_timing(&record.id, None, record.next_run_at, enabled)
            .await?;
        info!(schedule_id = %record.id, enabled, "Schedule toggled");
        Ok(record)
    }

    /// Delete a schedule and its executions. Dependents lose their dependency.
    pub async fn delete(&self, schedule_id: &str) -> Result<()> {
        if !self.persistence.delete_schedule(schedule_id).await? {
            return Err(Error::not_found("schedule", schedule_id));
        }
        info!(schedule_id = %schedule_id, "Schedule deleted");
        Ok(())
    }

    /// Fetch a schedule.
    pub async fn get(&self, schedule_id: &str) -> Result<ScheduleRecord> {
        self.persistence
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| Error::not_found("schedule", schedule_id))
    }

    /// All schedules.
    pub async fn list(&self) -> Result<Vec<ScheduleRecord>> {
        Ok(self.persistence.list_schedules().await?)
    }

    /// Executions of one schedule, newest first.
    pub async fn list_executions(
        &self,
        schedule_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScheduleExecutionRecord>> {
        self.get(schedule_id).await?;
        Ok(self
            .persistence
            .list_executions(schedule_id, limit.clamp(1, 1000), offset.max(0))
            .await?)
    }

    /// Aggregate statistics over all schedules.
    pub async fn stats(&self) -> Result<ScheduleStats> {
        let schedules = self.persistence.list_schedules().await?;
        let enabled = schedules.iter().filter(|s| s.enabled).count();

        let now = Utc::now();
        let counts = self
            .persistence
            .execution_counts(now - chrono::Duration::hours(24), now - chrono::Duration::days(7))
            .await?;

        let finished_7d = counts.completed_last_7d + counts.failed_last_7d;
        Ok(ScheduleStats {
            total: schedules.len(),
            enabled,
            disabled: schedules.len() - enabled,
            running: counts.running,
            failed_last_24h: counts.failed_last_24h,
            success_rate_7d: (finished_7d > 0)
                .then(|| counts.completed_last_7d as f64 / finished_7d as f64),
        })
    }

    /// Fire a schedule now, ignoring its timing, dependency and rate limits.
    /// Fails with `invalid_state` while the concurrency limit is reached.
    pub async fn trigger_now(&self, schedule_id: &str) -> Result<ScheduleExecutionRecord> {
        let schedule = self.get(schedule_id).await?;
        info!(schedule_id = %schedule.id, "Manual schedule trigger");
        self.scheduler.fire_now(&schedule, Utc::now()).await
    }

    fn initial_next_run(
        &self,
        record: &ScheduleRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if !record.enabled {
            return Ok(None);
        }
        timing::first_fire(record, now).map_err(|e| Error::Validation(e.to_string()))
    }

    async fn validate(&self, record: &ScheduleRecord) -> Result<()> {
        if record.name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        if self.persistence.get_action(&record.action_id).await?.is_none() {
            return Err(Error::Validation(format!(
                "unknown action '{}'",
                record.action_id
            )));
        }
        timing::validate(record).map_err(|e| Error::Validation(e.to_string()))?;

        if record.max_concurrent < 1 {
            return Err(Error::Validation("max_concurrent must be at least 1".into()));
        }
        if record.retry_max_attempts < 1 {
            return Err(Error::Validation(
                "retry_max_attempts must be at least 1".into(),
            ));
        }
        if !(0..=MAX_DURATION_SECONDS).contains(&record.retry_delay_seconds) {
            return Err(Error::Validation(format!(
                "retry_delay_seconds must be between 0 and {}",
                MAX_DURATION_SECONDS
            )));
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&record.backoff_multiplier) {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be between 1 and {}",
                MAX_BACKOFF_MULTIPLIER
            )));
        }
        if record
            .timeout_seconds
            .is_some_and(|t| !(1..=MAX_DURATION_SECONDS).contains(&t))
        {
            return Err(Error::Validation(format!(
                "timeout_seconds must be between 1 and {}",
                MAX_DURATION_SECONDS
            )));
        }
        if record.rate_limit_per_hour.is_some_and(|n| n <= 0)
            || record.rate_limit_per_day.is_some_and(|n| n <= 0)
        {
            return Err(Error::Validation("rate limits must be positive".into()));
        }

        if let Some(dependency) = &record.depends_on_schedule_id {
            self.validate_dependency(&record.id, dependency).await?;
        }
        Ok(())
    }

    /// The predecessor must exist, differ from the schedule, and not lead back
    /// to it through its own chain.
    async fn validate_dependency(&self, schedule_id: &str, dependency: &str) -> Result<()> {
        if dependency == schedule_id {
            return Err(Error::Validation(
                "a schedule cannot depend on itself".into(),
            ));
        }

        let links: HashMap<String, Option<String>> = self
            .persistence
            .list_schedules()
            .await?
            .into_iter()
            .map(|s| (s.id, s.depends_on_schedule_id))
            .collect();

        if !links.contains_key(dependency) {
            return Err(Error::Validation(format!(
                "dependency '{}' does not exist",
                dependency
            )));
        }

        let mut cursor = Some(dependency.to_string());
        let mut steps = 0;
        while let Some(current) = cursor {
            if current == schedule_id {
                return Err(Error::Validation(format!(
                    "dependency on '{}' would create a cycle",
                    dependency
                )));
            }
            steps += 1;
            if steps > links.len() {
                break;
            }
            cursor = links.get(&current).cloned().flatten();
        }
        Ok(())
    }
}
