// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborator-facing request handlers.
//!
//! Plain request/response functions meant to be wrapped by an HTTP layer.
//! Every handler returns either its response or an [`ErrorPayload`] of the
//! form `{kind, message}`.

use std::sync::Arc;
use std::time::Duration;

use cadence_core::Persistence;
use cadence_core::persistence::{
    ActionRecord, ListRunsFilter, RunRecord, ScheduleExecutionRecord, ScheduleRecord,
    TriggerInvocationRecord, TriggerRecord,
};
use cadence_core::status::{OriginKind, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, ErrorPayload};
use crate::events::RunEventSubscription;
use crate::orchestrator::{CancelRunRequest, Orchestrator, RunOrigin, StartRunRequest};
use crate::runner::PoolStats;
use crate::schedules::{ScheduleService, ScheduleSpec, ScheduleStats};
use crate::triggers::{InvokeRequest, TriggerService, TriggerSpec};

/// Handler result carrying the structured error payload.
pub type HandlerResult<T> = std::result::Result<T, ErrorPayload>;

fn payload(err: Error) -> ErrorPayload {
    debug!(kind = err.kind(), error = %err, "Request failed");
    err.to_payload()
}

/// Shared state for the handlers.
pub struct HandlerState {
    /// State store.
    pub persistence: Arc<dyn Persistence>,
    /// Run state machine.
    pub orchestrator: Arc<Orchestrator>,
    /// Schedule management.
    pub schedules: Arc<ScheduleService>,
    /// Trigger management and gateway.
    pub triggers: Arc<TriggerService>,
    /// When the engine started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Engine version string.
    pub version: String,
}

impl HandlerState {
    /// Create handler state.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        orchestrator: Arc<Orchestrator>,
        schedules: Arc<ScheduleService>,
        triggers: Arc<TriggerService>,
    ) -> Self {
        Self {
            persistence,
            orchestrator,
            schedules,
            triggers,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get the engine uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    /// Whether the state store answered.
    pub healthy: bool,
    /// Engine version.
    pub version: String,
    /// Uptime in milliseconds.
    pub uptime_ms: i64,
    /// Worker pool occupancy.
    pub pool: PoolStats,
}

/// Handle health check request.
pub async fn handle_health_check(state: &HandlerState) -> HandlerResult<HealthCheckResponse> {
    let healthy = state.persistence.list_actions().await.is_ok();
    Ok(HealthCheckResponse {
        healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
        pool: state.orchestrator.executor().stats().await,
    })
}

// ============================================================================
// Actions
// ============================================================================

/// Response to an action import.
#[derive(Debug, Clone, Serialize)]
pub struct ImportActionsResponse {
    /// Actions written.
    pub imported: usize,
    /// Reload time announced to subscribers.
    pub mtime: DateTime<Utc>,
}

/// Import (insert or replace) action definitions and announce the reload
/// with `mtime_changed`.
pub async fn handle_import_actions(
    state: &HandlerState,
    actions: Vec<ActionRecord>,
) -> HandlerResult<ImportActionsResponse> {
    for action in &actions {
        if action.id.trim().is_empty() || action.entry_point.trim().is_empty() {
            return Err(payload(Error::Validation(
                "actions need an id and an entry_point".into(),
            )));
        }
        if let Some(schema) = &action.input_schema
            && let Err(e) = jsonschema::validator_for(&schema.0)
        {
            return Err(payload(Error::Validation(format!(
                "action '{}' has an invalid input schema: {}",
                action.id, e
            ))));
        }
    }

    for action in &actions {
        state
            .persistence
            .import_action(action)
            .await
            .map_err(|e| payload(e.into()))?;
    }

    let mtime = Utc::now();
    state.orchestrator.events().publish_mtime_changed(mtime).await;
    info!(imported = actions.len(), "Actions imported");
    Ok(ImportActionsResponse {
        imported: actions.len(),
        mtime,
    })
}

/// List imported actions.
pub async fn handle_list_actions(state: &HandlerState) -> HandlerResult<Vec<ActionRecord>> {
    state
        .persistence
        .list_actions()
        .await
        .map_err(|e| payload(e.into()))
}

// ============================================================================
// Runs
// ============================================================================

/// Request to start a run through the API.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRunBody {
    /// Action to execute.
    pub action_id: String,
    /// Run input.
    #[serde(default)]
    pub input: Option<Value>,
    /// Optional correlation key.
    #[serde(default)]
    pub request_id: Option<String>,
    /// Optional time limit.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Start a run. Returns once the RUNNING row exists.
pub async fn handle_start_run(state: &HandlerState, body: StartRunBody) -> HandlerResult<RunRecord> {
    if body.timeout_seconds == Some(0) {
        return Err(payload(Error::Validation(
            "timeout_seconds must be positive".into(),
        )));
    }
    state
        .orchestrator
        .start_run(StartRunRequest {
            action_id: body.action_id,
            input: body.input.unwrap_or_else(|| Value::Object(Default::default())),
            origin: RunOrigin::Api,
            request_id: body.request_id.filter(|s| !s.is_empty()),
            timeout: body.timeout_seconds.map(Duration::from_secs),
        })
        .await
        .map_err(payload)
}

/// Fetch a run.
pub async fn handle_get_run(state: &HandlerState, run_id: &str) -> HandlerResult<RunRecord> {
    state
        .orchestrator
        .get_run(run_id)
        .await
        .map_err(payload)?
        .ok_or_else(|| payload(Error::not_found("run", run_id)))
}

/// Response to a cancel request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelRunResponse {
    /// True when this request moved the run to CANCELLED.
    pub cancelled: bool,
}

/// Cancel a run by run id or request id.
pub async fn handle_cancel_run(
    state: &HandlerState,
    request: CancelRunRequest,
) -> HandlerResult<CancelRunResponse> {
    let cancelled = state
        .orchestrator
        .cancel_run(request)
        .await
        .map_err(payload)?;
    Ok(CancelRunResponse { cancelled })
}

/// Query for listing runs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRunsQuery {
    /// Status filter.
    #[serde(default)]
    pub status: Option<RunStatus>,
    /// Origin kind filter.
    #[serde(default)]
    pub origin_kind: Option<OriginKind>,
    /// Origin id filter.
    #[serde(default)]
    pub origin_id: Option<String>,
    /// Action filter.
    #[serde(default)]
    pub action_id: Option<String>,
    /// Page size, 1..=1000.
    #[serde(default)]
    pub limit: Option<i64>,
    /// Rows to skip.
    #[serde(default)]
    pub offset: Option<i64>,
}

/// List runs, newest first.
pub async fn handle_list_runs(
    state: &HandlerState,
    query: ListRunsQuery,
) -> HandlerResult<Vec<RunRecord>> {
    let filter = ListRunsFilter {
        status: query.status,
        origin_kind: query.origin_kind,
        origin_id: query.origin_id,
        action_id: query.action_id,
        limit: Some(query.limit.unwrap_or(100).clamp(1, 1000)),
        offset: query.offset.map(|o| o.max(0)),
    };
    state.orchestrator.list_runs(&filter).await.map_err(payload)
}

// ============================================================================
// Live run events
// ============================================================================

/// Open a live run event stream. The first message is `runs_collected`,
/// followed by `run_added`, `run_changed` and `mtime_changed`.
///
/// A subscription that reports `Lagged` must be dropped and reopened.
pub async fn handle_start_listen_run_events(state: &HandlerState) -> RunEventSubscription {
    let subscription = state.orchestrator.events().subscribe().await;
    debug!(
        subscribers = state.orchestrator.events().subscriber_count(),
        "Run event listener attached"
    );
    subscription
}

// ============================================================================
// Schedules
// ============================================================================

/// Page of a list.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    /// Page size.
    #[serde(default = "default_page_limit")]
    pub limit: i64,
    /// Rows to skip.
    #[serde(default)]
    pub offset: i64,
}

fn default_page_limit() -> i64 {
    50
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            limit: default_page_limit(),
            offset: 0,
        }
    }
}

/// Create a schedule.
pub async fn handle_create_schedule(
    state: &HandlerState,
    spec: ScheduleSpec,
) -> HandlerResult<ScheduleRecord> {
    state.schedules.create(spec).await.map_err(payload)
}

/// Replace a schedule's editable fields.
pub async fn handle_update_schedule(
    state: &HandlerState,
    schedule_id: &str,
    spec: ScheduleSpec,
) -> HandlerResult<ScheduleRecord> {
    state.schedules.update(schedule_id, spec).await.map_err(payload)
}

/// Enable or disable a schedule.
pub async fn handle_set_schedule_enabled(
    state: &HandlerState,
    schedule_id: &str,
    enabled: bool,
) -> HandlerResult<ScheduleRecord> {
    state
        .schedules
        .set_enabled(schedule_id, enabled)
        .await
        .map_err(payload)
}

/// Delete a schedule.
pub async fn handle_delete_schedule(state: &HandlerState, schedule_id: &str) -> HandlerResult<()> {
    state.schedules.delete(schedule_id).await.map_err(payload)
}

/// Fetch a schedule.
pub async fn handle_get_schedule(
    state: &HandlerState,
    schedule_id: &str,
) -> HandlerResult<ScheduleRecord> {
    state.schedules.get(schedule_id).await.map_err(payload)
}

/// List schedules.
pub async fn handle_list_schedules(state: &HandlerState) -> HandlerResult<Vec<ScheduleRecord>> {
    state.schedules.list().await.map_err(payload)
}

/// List a schedule's executions, newest first.
pub async fn handle_list_executions(
    state: &HandlerState,
    schedule_id: &str,
    page: PageQuery,
) -> HandlerResult<Vec<ScheduleExecutionRecord>> {
    state
        .schedules
        .list_executions(schedule_id, page.limit, page.offset)
        .await
        .map_err(payload)
}

/// Aggregate schedule statistics.
pub async fn handle_schedule_stats(state: &HandlerState) -> HandlerResult<ScheduleStats> {
    state.schedules.stats().await.map_err(payload)
}

/// Fire a schedule immediately.
pub async fn handle_trigger_schedule_now(
    state: &HandlerState,
    schedule_id: &str,
) -> HandlerResult<ScheduleExecutionRecord> {
    state.schedules.trigger_now(schedule_id).await.map_err(payload)
}

// ============================================================================
// Triggers
// ============================================================================

/// Create a trigger.
pub async fn handle_create_trigger(
    state: &HandlerState,
    spec: TriggerSpec,
) -> HandlerResult<TriggerRecord> {
    state.triggers.create(spec).await.map_err(payload)
}

/// Replace a trigger's editable fields.
pub async fn handle_update_trigger(
    state: &HandlerState,
    trigger_id: &str,
    spec: TriggerSpec,
) -> HandlerResult<TriggerRecord> {
    state.triggers.update(trigger_id, spec).await.map_err(payload)
}

/// Enable or disable a trigger.
pub async fn handle_set_trigger_enabled(
    state: &HandlerState,
    trigger_id: &str,
    enabled: bool,
) -> HandlerResult<TriggerRecord> {
    state
        .triggers
        .set_enabled(trigger_id, enabled)
        .await
        .map_err(payload)
}

/// Delete a trigger.
pub async fn handle_delete_trigger(state: &HandlerState, trigger_id: &str) -> HandlerResult<()> {
    state.triggers.delete(trigger_id).await.map_err(payload)
}

/// List triggers.
pub async fn handle_list_triggers(state: &HandlerState) -> HandlerResult<Vec<TriggerRecord>> {
    state.triggers.list().await.map_err(payload)
}

/// Webhook-style invocation as received by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct InvokeTriggerRequest {
    /// Parsed body.
    pub payload: Value,
    /// Raw body bytes, used for signature checks.
    pub raw_body: Option<Vec<u8>>,
    /// Caller address.
    pub source_ip: Option<String>,
    /// HTTP method.
    pub method: Option<String>,
    /// Secret or `sha256=` signature header.
    pub credential: Option<String>,
}

/// Invoke a trigger. Refusals are recorded invocations, not errors.
pub async fn handle_invoke_trigger(
    state: &HandlerState,
    trigger_id: &str,
    request: InvokeTriggerRequest,
) -> HandlerResult<TriggerInvocationRecord> {
    state
        .triggers
        .invoke(
            trigger_id,
            InvokeRequest {
                payload: request.payload,
                source_ip: request.source_ip,
                method: request.method,
                credential: request.credential,
                raw_body: request.raw_body,
            },
        )
        .await
        .map_err(payload)
}

/// List a trigger's invocations, newest first.
pub async fn handle_list_invocations(
    state: &HandlerState,
    trigger_id: &str,
    page: PageQuery,
) -> HandlerResult<Vec<TriggerInvocationRecord>> {
    state
        .triggers
        .list_invocations(trigger_id, page.limit, page.offset)
        .await
        .map_err(payload)
}
