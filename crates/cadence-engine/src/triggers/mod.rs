// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger gateway.
//!
//! Turns external events into runs. Every invocation is recorded with one of
//! four outcomes: ACCEPTED (a run was started), REJECTED (disabled trigger,
//! wrong method or bad secret), RATE_LIMITED, or ERROR (payload merge or run
//! start failed). Only ACCEPTED invocations create a run.
//!
//! Webhooks call [`TriggerService::invoke`] directly. Email and file-watch
//! events are pushed into an mpsc inbox drained by [`inbox::run_inbox`].

pub mod auth;
pub mod inbox;
pub mod rate_limit;
pub mod watcher;

use std::sync::Arc;

use cadence_core::Persistence;
use cadence_core::persistence::{Json, TriggerInvocationRecord, TriggerRecord};
use cadence_core::status::{InvocationStatus, TriggerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::orchestrator::{Orchestrator, RunOrigin, StartRunRequest};

pub use inbox::{InboundEmail, InboundEvent};
pub use rate_limit::SlidingWindowLimiter;
pub use watcher::FileWatchSource;

/// Method accepted by webhooks that do not name one.
pub const DEFAULT_WEBHOOK_METHOD: &str = "POST";

/// File events a file-watch trigger can subscribe to.
pub const WATCH_EVENTS: &[&str] = &["created", "modified", "removed"];

const WEBHOOK_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn default_true() -> bool {
    true
}

/// Editable trigger fields, used for both create and update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Display name.
    pub name: String,
    /// Event source kind.
    pub trigger_type: TriggerType,
    /// Action started on acceptance.
    pub action_id: String,
    /// Base input, must be a JSON object.
    #[serde(default = "empty_object")]
    pub inputs_template: Value,
    /// Whether invocations are accepted.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Webhook shared secret.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Webhook HTTP method, POST when absent.
    #[serde(default)]
    pub webhook_method: Option<String>,
    /// Sliding-window cap per minute.
    #[serde(default)]
    pub rate_limit_max_per_minute: Option<i64>,
    /// Recipient address for email triggers.
    #[serde(default)]
    pub email_address: Option<String>,
    /// Directory for file-watch triggers.
    #[serde(default)]
    pub watch_path: Option<String>,
    /// Glob applied to file names.
    #[serde(default)]
    pub watch_pattern: Option<String>,
    /// Subset of [`WATCH_EVENTS`]; empty means all.
    #[serde(default)]
    pub watch_events: Vec<String>,
}

impl TriggerSpec {
    /// Required fields only; everything else at its default.
    pub fn new(
        name: impl Into<String>,
        trigger_type: TriggerType,
        action_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            trigger_type,
            action_id: action_id.into(),
            inputs_template: empty_object(),
            enabled: true,
            webhook_secret: None,
            webhook_method: None,
            rate_limit_max_per_minute: None,
            email_address: None,
            watch_path: None,
            watch_pattern: None,
            watch_events: Vec::new(),
        }
    }

    fn into_record(self, id: String, created_at: DateTime<Utc>, now: DateTime<Utc>) -> TriggerRecord {
        TriggerRecord {
            id,
            name: self.name,
            trigger_type: self.trigger_type,
            action_id: self.action_id,
            inputs_template: Json(self.inputs_template),
            enabled: self.enabled,
            webhook_secret: self.webhook_secret,
            webhook_method: self.webhook_method.map(|m| m.trim().to_ascii_uppercase()),
            rate_limit_max_per_minute: self.rate_limit_max_per_minute,
            email_address: self.email_address.map(|a| a.trim().to_string()),
            watch_path: self.watch_path,
            watch_pattern: self.watch_pattern,
            watch_events: Json(self.watch_events),
            invocation_count: 0,
            last_invoked_at: None,
            created_at,
            updated_at: now,
        }
    }
}

/// One invocation as received from a source.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    /// Event payload.
    pub payload: Value,
    /// Caller address.
    pub source_ip: Option<String>,
    /// HTTP method, webhooks only.
    pub method: Option<String>,
    /// Shared secret or `sha256=<hex>` signature, webhooks only.
    pub credential: Option<String>,
    /// Raw request body the signature covers. Defaults to the serialized
    /// payload.
    pub raw_body: Option<Vec<u8>>,
}

impl InvokeRequest {
    /// Request carrying only a payload.
    pub fn with_payload(payload: Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }
}

/// Merge an invocation payload into a trigger's input template.
///
/// Object payloads are merged key by key over the template; any other payload
/// is stored under `payload`.
pub fn merge_payload(template: &Value, payload: &Value) -> Result<Value> {
    let Value::Object(base) = template else {
        return Err(Error::Validation(
            "inputs_template must be a JSON object".into(),
        ));
    };

    let mut merged = base.clone();
    match payload {
        Value::Object(fields) => {
            for (key, value) in fields {
                merged.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => {
            merged.insert("payload".to_string(), other.clone());
        }
    }
    Ok(Value::Object(merged))
}

/// Trigger management and the invocation gateway.
pub struct TriggerService {
    persistence: Arc<dyn Persistence>,
    orchestrator: Arc<Orchestrator>,
    limiter: SlidingWindowLimiter,
    changed: Arc<Notify>,
}

impl TriggerService {
    /// Create the service.
    pub fn new(persistence: Arc<dyn Persistence>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            persistence,
            orchestrator,
            limiter: SlidingWindowLimiter::new(),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever a trigger is created, edited, toggled or deleted.
    pub fn changed(&self) -> Arc<Notify> {
        self.changed.clone()
    }

    /// Validate and store a new trigger.
    pub async fn create(&self, spec: TriggerSpec) -> Result<TriggerRecord> {
        let now = Utc::now();
        let record = spec.into_record(Uuid::new_v4().to_string(), now, now);
        self.validate(&record).await?;

        self.persistence.insert_trigger(&record).await?;
        info!(
            trigger_id = %record.id,
            name = %record.name,
            trigger_type = %record.trigger_type,
            "Trigger created"
        );
        self.changed.notify_one();
        Ok(record)
    }

    /// Replace the editable fields of a trigger. Counters are kept.
    pub async fn update(&self, trigger_id: &str, spec: TriggerSpec) -> Result<TriggerRecord> {
        let existing = self.get(trigger_id).await?;
        let mut record = spec.into_record(existing.id.clone(), existing.created_at, Utc::now());
        record.invocation_count = existing.invocation_count;
        record.last_invoked_at = existing.last_invoked_at;
        self.validate(&record).await?;

        if !self.persistence.update_trigger(&record).await? {
            return Err(Error::not_found("trigger", trigger_id));
        }
        self.limiter.forget(trigger_id).await;
        info!(trigger_id = %record.id, "Trigger updated");
        self.changed.notify_one();
        Ok(record)
    }

    /// Enable or disable a trigger.
    pub async fn set_enabled(&self, trigger_id: &str, enabled: bool) -> Result<TriggerRecord> {
        let mut record = self.get(trigger_id).await?;
        record.enabled = enabled;
        record.updated_at = Utc::now();
        if !self.persistence.update_trigger(&record).await? {
            return Err(Error::not_found("trigger", trigger_id));
        }
        info!(trigger_id = %record.id, enabled, "Trigger toggled");
        self.changed.notify_one();
        Ok(record)
    }

    /// Delete a trigger and its invocation history.
    pub async fn delete(&self, trigger_id: &str) -> Result<()> {
        if !self.persistence.delete_trigger(trigger_id).await? {
            return Err(Error::not_found("trigger", trigger_id));
        }
        self.limiter.forget(trigger_id).await;
        info!(trigger_id = %trigger_id, "Trigger deleted");
        self.changed.notify_one();
        Ok(())
    }

    /// Fetch a trigger.
    pub async fn get(&self, trigger_id: &str) -> Result<TriggerRecord> {
        self.persistence
            .get_trigger(trigger_id)
            .await?
            .ok_or_else(|| Error::not_found("trigger", trigger_id))
    }

    /// All triggers.
    pub async fn list(&self) -> Result<Vec<TriggerRecord>> {
        Ok(self.persistence.list_triggers().await?)
    }

    /// Invocations of one trigger, newest first.
    pub async fn list_invocations(
        &self,
        trigger_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TriggerInvocationRecord>> {
        self.get(trigger_id).await?;
        Ok(self
            .persistence
            .list_invocations(trigger_id, limit.clamp(1, 1000), offset.max(0))
            .await?)
    }

    /// Invoke a trigger and record the outcome.
    ///
    /// Returns `NotFound` for an unknown trigger; every other outcome is a
    /// recorded invocation.
    pub async fn invoke(
        &self,
        trigger_id: &str,
        request: InvokeRequest,
    ) -> Result<TriggerInvocationRecord> {
        let trigger = self.get(trigger_id).await?;
        let now = Utc::now();

        let (status, run_id, error_message) = match self.admit(&trigger, &request, now).await {
            Err((status, reason)) => (status, None, Some(reason)),
            Ok(()) => match self.start(&trigger, &request.payload).await {
                Ok(run_id) => (InvocationStatus::Accepted, Some(run_id), None),
                Err(e) => (InvocationStatus::Error, None, Some(e.to_string())),
            },
        };

        let invocation = TriggerInvocationRecord {
            id: Uuid::new_v4().to_string(),
            trigger_id: trigger.id.clone(),
            status,
            run_id,
            payload: Some(Json(request.payload)),
            source_ip: request.source_ip,
            error_message,
            invoked_at: now,
        };
        self.persistence.record_invocation(&invocation).await?;

        match invocation.status {
            InvocationStatus::Accepted => info!(
                trigger_id = %trigger.id,
                invocation_id = %invocation.id,
                run_id = ?invocation.run_id,
                "Trigger accepted"
            ),
            InvocationStatus::Error => warn!(
                trigger_id = %trigger.id,
                error = ?invocation.error_message,
                "Trigger invocation failed"
            ),
            status => debug!(
                trigger_id = %trigger.id,
                status = %status,
                reason = ?invocation.error_message,
                "Trigger invocation refused"
            ),
        }
        Ok(invocation)
    }

    /// Enabled email triggers listening on `address`.
    pub async fn email_triggers_for(&self, address: &str) -> Result<Vec<TriggerRecord>> {
        let address = address.trim();
        Ok(self
            .persistence
            .list_triggers()
            .await?
            .into_iter()
            .filter(|t| {
                t.enabled
                    && t.trigger_type == TriggerType::Email
                    && t.email_address
                        .as_deref()
                        .is_some_and(|a| a.eq_ignore_ascii_case(address))
            })
            .collect())
    }

    /// Enabled file-watch triggers.
    pub async fn file_watch_triggers(&self) -> Result<Vec<TriggerRecord>> {
        Ok(self
            .persistence
            .list_triggers()
            .await?
            .into_iter()
            .filter(|t| t.enabled && t.trigger_type == TriggerType::FileWatch)
            .collect())
    }

    /// Checks that decide REJECTED and RATE_LIMITED, in that order.
    async fn admit(
        &self,
        trigger: &TriggerRecord,
        request: &InvokeRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), (InvocationStatus, String)> {
        if !trigger.enabled {
            return Err((InvocationStatus::Rejected, "trigger is disabled".into()));
        }

        if trigger.trigger_type == TriggerType::Webhook {
            let expected = trigger
                .webhook_method
                .as_deref()
                .unwrap_or(DEFAULT_WEBHOOK_METHOD);
            if let Some(method) = &request.method
                && !method.eq_ignore_ascii_case(expected)
            {
                return Err((
                    InvocationStatus::Rejected,
                    format!("method {} not allowed, expected {}", method, expected),
                ));
            }

            if let Some(secret) = &trigger.webhook_secret {
                let body = match &request.raw_body {
                    Some(raw) => raw.clone(),
                    None => serde_json::to_vec(&request.payload).unwrap_or_default(),
                };
                if !auth::verify_webhook_credential(secret, request.credential.as_deref(), &body) {
                    return Err((InvocationStatus::Rejected, "invalid webhook secret".into()));
                }
            }
        }

        if let Some(max) = trigger.rate_limit_max_per_minute
            && !self.limiter.try_acquire(&trigger.id, max, now).await
        {
            return Err((
                InvocationStatus::RateLimited,
                format!("rate limit of {} per minute exceeded", max),
            ));
        }
        Ok(())
    }

    async fn start(&self, trigger: &TriggerRecord, payload: &Value) -> Result<String> {
        let input = merge_payload(&trigger.inputs_template.0, payload)?;
        let run = self
            .orchestrator
            .start_run(StartRunRequest {
                action_id: trigger.action_id.clone(),
                input,
                origin: RunOrigin::Trigger {
                    trigger_id: trigger.id.clone(),
                },
                request_id: None,
                timeout: None,
            })
            .await?;
        Ok(run.id)
    }

    async fn validate(&self, record: &TriggerRecord) -> Result<()> {
        if record.name.trim().is_empty() {
            return Err(Error::Validation("name must not be empty".into()));
        }
        if !record.inputs_template.0.is_object() {
            return Err(Error::Validation(
                "inputs_template must be a JSON object".into(),
            ));
        }
        if self.persistence.get_action(&record.action_id).await?.is_none() {
            return Err(Error::Validation(format!(
                "unknown action '{}'",
                record.action_id
            )));
        }
        if record.rate_limit_max_per_minute.is_some_and(|n| n <= 0) {
            return Err(Error::Validation(
                "rate_limit_max_per_minute must be positive".into(),
            ));
        }

        match record.trigger_type {
            TriggerType::Webhook => {
                if let Some(method) = &record.webhook_method
                    && !WEBHOOK_METHODS.contains(&method.as_str())
                {
                    return Err(Error::Validation(format!(
                        "unsupported webhook method '{}'",
                        method
                    )));
                }
                if record.webhook_secret.as_deref().is_some_and(str::is_empty) {
                    return Err(Error::Validation(
                        "webhook_secret must not be empty".into(),
                    ));
                }
            }
            TriggerType::Email => {
                let valid = record
                    .email_address
                    .as_deref()
                    .is_some_and(|a| a.contains('@') && !a.starts_with('@') && !a.ends_with('@'));
                if !valid {
                    return Err(Error::Validation(
                        "email triggers need a valid email_address".into(),
                    ));
                }
            }
            TriggerType::FileWatch => {
                if record
                    .watch_path
                    .as_deref()
                    .is_none_or(|p| p.trim().is_empty())
                {
                    return Err(Error::Validation(
                        "file_watch triggers need a watch_path".into(),
                    ));
                }
                if let Some(pattern) = &record.watch_pattern {
                    glob::Pattern::new(pattern).map_err(|e| {
                        Error::Validation(format!("invalid watch_pattern '{}': {}", pattern, e))
                    })?;
                }
                if let Some(unknown) = record
                    .watch_events
                    .0
                    .iter()
                    .find(|e| !WATCH_EVENTS.contains(&e.as_str()))
                {
                    return Err(Error::Validation(format!(
                        "unknown watch event '{}'",
                        unknown
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_object_payload() {
        let merged = merge_payload(
            &json!({"env": "prod", "order": 0}),
            &json!({"order": 42, "sku": "A-1"}),
        )
        .unwrap();
        assert_eq!(merged, json!({"env": "prod", "order": 42, "sku": "A-1"}));
    }

    #[test]
    fn test_merge_scalar_payload() {
        let merged = merge_payload(&json!({"env": "prod"}), &json!([1, 2])).unwrap();
        assert_eq!(merged, json!({"env": "prod", "payload": [1, 2]}));

        let merged = merge_payload(&json!({"env": "prod"}), &Value::Null).unwrap();
        assert_eq!(merged, json!({"env": "prod"}));
    }

    #[test]
    fn test_merge_rejects_non_object_template() {
        let err = merge_payload(&json!("x"), &json!({})).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_spec_normalizes_method() {
        let mut spec = TriggerSpec::new("hook", TriggerType::Webhook, "pkg.act");
        spec.webhook_method = Some(" put ".into());
        let now = Utc::now();
        let record = spec.into_record("t-1".into(), now, now);
        assert_eq!(record.webhook_method.as_deref(), Some("PUT"));
        assert_eq!(record.invocation_count, 0);
    }
}
