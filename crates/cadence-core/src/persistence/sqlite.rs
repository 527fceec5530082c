// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use tracing::debug;

use crate::error::CoreError;
use crate::status::{ExecutionStatus, InvocationStatus, OriginKind, RunStatus};

use super::{
    ActionRecord, ExecutionCounts, ListRunsFilter, NewRun, Persistence, RunCompletion,
    RunRecord, ScheduleExecutionRecord, ScheduleRecord, TriggerInvocationRecord, TriggerRecord,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const RUN_COLUMNS: &str = r#"
    id, numbered_id, action_id, status, origin_kind, origin_id, request_id,
    input, result, error, stdout, stderr, exit_code, artifacts_dir,
    started_at, finished_at, duration_seconds, created_at
"#;

const SCHEDULE_COLUMNS: &str = r#"
    id, name, description, action_id, inputs, schedule_type, cron_expression,
    interval_seconds, weekdays, weekday_times, run_once_at, timezone, enabled,
    last_run_at, next_run_at, skip_if_running, max_concurrent, timeout_seconds,
    retry_enabled, retry_max_attempts, retry_delay_seconds, backoff_multiplier,
    rate_limit_per_hour, rate_limit_per_day, depends_on_schedule_id,
    dependency_mode, notify_on_success, notify_on_failure, notification_channels,
    priority, created_at, updated_at
"#;

const EXECUTION_COLUMNS: &str = r#"
    id, schedule_id, run_id, status, attempt, scheduled_at, started_at,
    finished_at, duration_seconds, error_code, error_message, skip_reason,
    retry_at, notification_sent, created_at
"#;

const TRIGGER_COLUMNS: &str = r#"
    id, name, trigger_type, action_id, inputs_template, enabled, webhook_secret,
    webhook_method, rate_limit_max_per_minute, email_address, watch_path,
    watch_pattern, watch_events, invocation_count, last_invoked_at,
    created_at, updated_at
"#;

const INVOCATION_COLUMNS: &str = r#"
    id, trigger_id, status, run_id, payload, source_ip, error_message, invoked_at
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running [`crate::migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Enables WAL journaling so readers don't block the writer
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/cadence.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite path {:?}: {}", path, e),
            })?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrate(&pool).await?;
        debug!(path = %path.display(), "Opened SQLite state store");

        Ok(Self { pool })
    }

    /// Create a private in-memory database with migrations applied.
    ///
    /// Uses a single connection, since every `sqlite::memory:` connection
    /// opens its own database.
    pub async fn in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool, for callers that need raw queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }
}

fn conflict_or_db(err: sqlx::Error, entity: &'static str, id: &str) -> CoreError {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return CoreError::AlreadyExists {
            entity,
            id: id.to_string(),
        };
    }
    err.into()
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn import_action(&self, action: &ActionRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO actions (id, package_id, name, entry_point, input_schema,
                                 output_schema, enabled, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                package_id = excluded.package_id,
                name = excluded.name,
                entry_point = excluded.entry_point,
                input_schema = excluded.input_schema,
                output_schema = excluded.output_schema,
                enabled = excluded.enabled
            "#,
        )
        .bind(&action.id)
        .bind(&action.package_id)
        .bind(&action.name)
        .bind(&action.entry_point)
        .bind(&action.input_schema)
        .bind(&action.output_schema)
        .bind(action.enabled)
        .bind(action.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_action(&self, action_id: &str) -> Result<Option<ActionRecord>, CoreError> {
        let record = sqlx::query_as::<_, ActionRecord>(
            r#"
            SELECT id, package_id, name, entry_point, input_schema, output_schema,
                   enabled, created_at
            FROM actions
            WHERE id = ?1
            "#,
        )
        .bind(action_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_actions(&self) -> Result<Vec<ActionRecord>, CoreError> {
        let records = sqlx::query_as::<_, ActionRecord>(
            r#"
            SELECT id, package_id, name, entry_point, input_schema, output_schema,
                   enabled, created_at
            FROM actions
            ORDER BY package_id, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn set_action_enabled(
        &self,
        action_id: &str,
        enabled: bool,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE actions SET enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(action_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_run(&self, run: &NewRun) -> Result<RunRecord, CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO runs (id, numbered_id, action_id, status, origin_kind, origin_id,
                              request_id, input, artifacts_dir, started_at, created_at)
            VALUES (?1, (SELECT COALESCE(MAX(numbered_id), 0) + 1 FROM runs),
                    ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&run.id)
        .bind(&run.action_id)
        .bind(run.status)
        .bind(run.origin_kind)
        .bind(&run.origin_id)
        .bind(&run.request_id)
        .bind(Json(&run.input))
        .bind(&run.artifacts_dir)
        .bind(run.started_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_db(e, "run", &run.id))?;

        self.get_run(&run.id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run.id.clone(),
            })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn get_run_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM runs WHERE request_id = ?1 ORDER BY numbered_id DESC LIMIT 1",
            RUN_COLUMNS
        );
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_runs(&self, filter: &ListRunsFilter) -> Result<Vec<RunRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM runs
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR origin_kind = ?2)
              AND (?3 IS NULL OR origin_id = ?3)
              AND (?4 IS NULL OR action_id = ?4)
            ORDER BY numbered_id DESC
            LIMIT ?5 OFFSET ?6
            "#,
            RUN_COLUMNS
        );
        let records = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(filter.status)
            .bind(filter.origin_kind)
            .bind(&filter.origin_id)
            .bind(&filter.action_id)
            .bind(filter.limit.unwrap_or(100))
            .bind(filter.offset.unwrap_or(0))
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn complete_run_if_running(
        &self,
        completion: &RunCompletion,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?1,
                finished_at = ?2,
                duration_seconds = (julianday(?2) - julianday(started_at)) * 86400.0,
                result = ?3,
                error = ?4,
                stdout = ?5,
                stderr = ?6,
                exit_code = ?7
            WHERE id = ?8
              AND status = 'RUNNING'
            "#,
        )
        .bind(completion.status)
        .bind(completion.finished_at)
        .bind(completion.result.as_ref().map(Json))
        .bind(&completion.error)
        .bind(&completion.stdout)
        .bind(&completion.stderr)
        .bind(completion.exit_code)
        .bind(&completion.run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn count_running_runs(
        &self,
        origin_kind: OriginKind,
        origin_id: &str,
    ) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM runs
            WHERE origin_kind = ?1 AND origin_id = ?2 AND status = ?3
            "#,
        )
        .bind(origin_kind)
        .bind(origin_id)
        .bind(RunStatus::Running)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn insert_schedule(&self, s: &ScheduleRecord) -> Result<(), CoreError> {
        let sql = format!(
            r#"
            INSERT INTO schedules ({})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                    ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30,
                    ?31, ?32)
            "#,
            SCHEDULE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&s.id)
            .bind(&s.name)
            .bind(&s.description)
            .bind(&s.action_id)
            .bind(&s.inputs)
            .bind(s.schedule_type)
            .bind(&s.cron_expression)
            .bind(s.interval_seconds)
            .bind(&s.weekdays)
            .bind(&s.weekday_times)
            .bind(s.run_once_at)
            .bind(&s.timezone)
            .bind(s.enabled)
            .bind(s.last_run_at)
            .bind(s.next_run_at)
            .bind(s.skip_if_running)
            .bind(s.max_concurrent)
            .bind(s.timeout_seconds)
            .bind(s.retry_enabled)
            .bind(s.retry_max_attempts)
            .bind(s.retry_delay_seconds)
            .bind(s.backoff_multiplier)
            .bind(s.rate_limit_per_hour)
            .bind(s.rate_limit_per_day)
            .bind(&s.depends_on_schedule_id)
            .bind(s.dependency_mode)
            .bind(s.notify_on_success)
            .bind(s.notify_on_failure)
            .bind(&s.notification_channels)
            .bind(s.priority)
            .bind(s.created_at)
            .bind(s.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or_db(e, "schedule", &s.id))?;

        Ok(())
    }

    async fn update_schedule(&self, s: &ScheduleRecord) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules SET
                name = ?2, description = ?3, action_id = ?4, inputs = ?5,
                schedule_type = ?6, cron_expression = ?7, interval_seconds = ?8,
                weekdays = ?9, weekday_times = ?10, run_once_at = ?11, timezone = ?12,
                enabled = ?13, last_run_at = ?14, next_run_at = ?15,
                skip_if_running = ?16, max_concurrent = ?17, timeout_seconds = ?18,
                retry_enabled = ?19, retry_max_attempts = ?20, retry_delay_seconds = ?21,
                backoff_multiplier = ?22, rate_limit_per_hour = ?23,
                rate_limit_per_day = ?24, depends_on_schedule_id = ?25,
                dependency_mode = ?26, notify_on_success = ?27, notify_on_failure = ?28,
                notification_channels = ?29, priority = ?30, updated_at = ?31
            WHERE id = ?1
            "#,
        )
        .bind(&s.id)
        .bind(&s.name)
        .bind(&s.description)
        .bind(&s.action_id)
        .bind(&s.inputs)
        .bind(s.schedule_type)
        .bind(&s.cron_expression)
        .bind(s.interval_seconds)
        .bind(&s.weekdays)
        .bind(&s.weekday_times)
        .bind(s.run_once_at)
        .bind(&s.timezone)
        .bind(s.enabled)
        .bind(s.last_run_at)
        .bind(s.next_run_at)
        .bind(s.skip_if_running)
        .bind(s.max_concurrent)
        .bind(s.timeout_seconds)
        .bind(s.retry_enabled)
        .bind(s.retry_max_attempts)
        .bind(s.retry_delay_seconds)
        .bind(s.backoff_multiplier)
        .bind(s.rate_limit_per_hour)
        .bind(s.rate_limit_per_day)
        .bind(&s.depends_on_schedule_id)
        .bind(s.dependency_mode)
        .bind(s.notify_on_success)
        .bind(s.notify_on_failure)
        .bind(&s.notification_channels)
        .bind(s.priority)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_schedule(&self, schedule_id: &str) -> Result<Option<ScheduleRecord>, CoreError> {
        let sql = format!("SELECT {} FROM schedules WHERE id = ?1", SCHEDULE_COLUMNS);
        let record = sqlx::query_as::<_, ScheduleRecord>(&sql)
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM schedules ORDER BY priority DESC, name",
            SCHEDULE_COLUMNS
        );
        let records = sqlx::query_as::<_, ScheduleRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn delete_schedule(&self, schedule_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?1")
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM schedules
            WHERE enabled = 1
              AND next_run_at IS NOT NULL
              AND next_run_at <= ?1
            ORDER BY priority DESC, next_run_at ASC
            "#,
            SCHEDULE_COLUMNS
        );
        let records = sqlx::query_as::<_, ScheduleRecord>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn update_schedule_timing(
        &self,
        schedule_id: &str,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET last_run_at = COALESCE(?1, last_run_at),
                next_run_at = ?2,
                enabled = ?3
            WHERE id = ?4
            "#,
        )
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(enabled)
        .bind(schedule_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_execution(&self, e: &ScheduleExecutionRecord) -> Result<(), CoreError> {
        let sql = format!(
            r#"
            INSERT INTO schedule_executions ({})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            EXECUTION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&e.id)
            .bind(&e.schedule_id)
            .bind(&e.run_id)
            .bind(e.status)
            .bind(e.attempt)
            .bind(e.scheduled_at)
            .bind(e.started_at)
            .bind(e.finished_at)
            .bind(e.duration_seconds)
            .bind(&e.error_code)
            .bind(&e.error_message)
            .bind(&e.skip_reason)
            .bind(e.retry_at)
            .bind(e.notification_sent)
            .bind(e.created_at)
            .execute(&self.pool)
            .await
            .map_err(|err| conflict_or_db(err, "schedule execution", &e.id))?;

        Ok(())
    }

    async fn update_execution(&self, e: &ScheduleExecutionRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE schedule_executions SET
                run_id = ?2, status = ?3, started_at = ?4, finished_at = ?5,
                duration_seconds = ?6, error_code = ?7, error_message = ?8,
                skip_reason = ?9, retry_at = ?10, notification_sent = ?11
            WHERE id = ?1
            "#,
        )
        .bind(&e.id)
        .bind(&e.run_id)
        .bind(e.status)
        .bind(e.started_at)
        .bind(e.finished_at)
        .bind(e.duration_seconds)
        .bind(&e.error_code)
        .bind(&e.error_message)
        .bind(&e.skip_reason)
        .bind(e.retry_at)
        .bind(e.notification_sent)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ScheduleExecutionRecord>, CoreError> {
        let sql = format!(
            "SELECT {} FROM schedule_executions WHERE id = ?1",
            EXECUTION_COLUMNS
        );
        let record = sqlx::query_as::<_, ScheduleExecutionRecord>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_executions(
        &self,
        schedule_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ScheduleExecutionRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM schedule_executions
            WHERE schedule_id = ?1
            ORDER BY created_at DESC, attempt DESC
            LIMIT ?2 OFFSET ?3
            "#,
            EXECUTION_COLUMNS
        );
        let records = sqlx::query_as::<_, ScheduleExecutionRecord>(&sql)
            .bind(schedule_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn latest_execution(
        &self,
        schedule_id: &str,
    ) -> Result<Option<ScheduleExecutionRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM schedule_executions
            WHERE schedule_id = ?1
            ORDER BY created_at DESC, attempt DESC
            LIMIT 1
            "#,
            EXECUTION_COLUMNS
        );
        let record = sqlx::query_as::<_, ScheduleExecutionRecord>(&sql)
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_active_executions(&self) -> Result<Vec<ScheduleExecutionRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM schedule_executions
            WHERE status IN (?1, ?2)
            ORDER BY created_at ASC
            "#,
            EXECUTION_COLUMNS
        );
        let records = sqlx::query_as::<_, ScheduleExecutionRecord>(&sql)
            .bind(ExecutionStatus::Triggered)
            .bind(ExecutionStatus::Running)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn list_due_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleExecutionRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM schedule_executions
            WHERE status = ?1 AND retry_at IS NOT NULL AND retry_at <= ?2
            ORDER BY retry_at ASC
            "#,
            EXECUTION_COLUMNS
        );
        let records = sqlx::query_as::<_, ScheduleExecutionRecord>(&sql)
            .bind(ExecutionStatus::Retrying)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn count_fired_executions_since(
        &self,
        schedule_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM schedule_executions
            WHERE schedule_id = ?1
              AND run_id IS NOT NULL
              AND started_at >= ?2
            "#,
        )
        .bind(schedule_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn execution_counts(
        &self,
        since_24h: DateTime<Utc>,
        since_7d: DateTime<Utc>,
    ) -> Result<ExecutionCounts, CoreError> {
        let row: (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'FAILED' AND finished_at >= ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'COMPLETED' AND finished_at >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status = 'FAILED' AND finished_at >= ?2 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN status IN ('TRIGGERED', 'RUNNING') THEN 1 ELSE 0 END), 0)
            FROM schedule_executions
            "#,
        )
        .bind(since_24h)
        .bind(since_7d)
        .fetch_one(&self.pool)
        .await?;

        Ok(ExecutionCounts {
            failed_last_24h: row.0,
            completed_last_7d: row.1,
            failed_last_7d: row.2,
            running: row.3,
        })
    }

    async fn insert_trigger(&self, t: &TriggerRecord) -> Result<(), CoreError> {
        let sql = format!(
            r#"
            INSERT INTO triggers ({})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            TRIGGER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&t.id)
            .bind(&t.name)
            .bind(t.trigger_type)
            .bind(&t.action_id)
            .bind(&t.inputs_template)
            .bind(t.enabled)
            .bind(&t.webhook_secret)
            .bind(&t.webhook_method)
            .bind(t.rate_limit_max_per_minute)
            .bind(&t.email_address)
            .bind(&t.watch_path)
            .bind(&t.watch_pattern)
            .bind(&t.watch_events)
            .bind(t.invocation_count)
            .bind(t.last_invoked_at)
            .bind(t.created_at)
            .bind(t.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| conflict_or_db(e, "trigger", &t.id))?;

        Ok(())
    }

    async fn update_trigger(&self, t: &TriggerRecord) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET
                name = ?2, trigger_type = ?3, action_id = ?4, inputs_template = ?5,
                enabled = ?6, webhook_secret = ?7, webhook_method = ?8,
                rate_limit_max_per_minute = ?9, email_address = ?10, watch_path = ?11,
                watch_pattern = ?12, watch_events = ?13, updated_at = ?14
            WHERE id = ?1
            "#,
        )
        .bind(&t.id)
        .bind(&t.name)
        .bind(t.trigger_type)
        .bind(&t.action_id)
        .bind(&t.inputs_template)
        .bind(t.enabled)
        .bind(&t.webhook_secret)
        .bind(&t.webhook_method)
        .bind(t.rate_limit_max_per_minute)
        .bind(&t.email_address)
        .bind(&t.watch_path)
        .bind(&t.watch_pattern)
        .bind(&t.watch_events)
        .bind(t.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_trigger(&self, trigger_id: &str) -> Result<Option<TriggerRecord>, CoreError> {
        let sql = format!("SELECT {} FROM triggers WHERE id = ?1", TRIGGER_COLUMNS);
        let record = sqlx::query_as::<_, TriggerRecord>(&sql)
            .bind(trigger_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_triggers(&self) -> Result<Vec<TriggerRecord>, CoreError> {
        let sql = format!("SELECT {} FROM triggers ORDER BY name", TRIGGER_COLUMNS);
        let records = sqlx::query_as::<_, TriggerRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn delete_trigger(&self, trigger_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM triggers WHERE id = ?1")
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_invocation(&self, inv: &TriggerInvocationRecord) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO trigger_invocations ({})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            INVOCATION_COLUMNS
        );
        sqlx::query(&sql)
            .bind(&inv.id)
            .bind(&inv.trigger_id)
            .bind(inv.status)
            .bind(&inv.run_id)
            .bind(&inv.payload)
            .bind(&inv.source_ip)
            .bind(&inv.error_message)
            .bind(inv.invoked_at)
            .execute(&mut *tx)
            .await?;

        if inv.status == InvocationStatus::Accepted {
            sqlx::query(
                r#"
                UPDATE triggers
                SET invocation_count = invocation_count + 1,
                    last_invoked_at = ?1
                WHERE id = ?2
                "#,
            )
            .bind(inv.invoked_at)
            .bind(&inv.trigger_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_invocations(
        &self,
        trigger_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TriggerInvocationRecord>, CoreError> {
        let sql = format!(
            r#"
            SELECT {}
            FROM trigger_invocations
            WHERE trigger_id = ?1
            ORDER BY invoked_at DESC
            LIMIT ?2 OFFSET ?3
            "#,
            INVOCATION_COLUMNS
        );
        let records = sqlx::query_as::<_, TriggerInvocationRecord>(&sql)
            .bind(trigger_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }
}
