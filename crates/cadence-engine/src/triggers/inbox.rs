// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound event loop for email and file-watch triggers.

use std::sync::Arc;

use cadence_core::persistence::TriggerInvocationRecord;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, info, warn};

use super::{InvokeRequest, TriggerService};
use crate::error::Result;

/// A parsed email handed over by the mail collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEmail {
    /// Sender address.
    pub from: String,
    /// Recipient address, matched against `email_address`.
    pub to: String,
    /// Subject line.
    #[serde(default)]
    pub subject: String,
    /// Plain-text body.
    #[serde(default)]
    pub body: String,
}

/// Event waiting to be turned into trigger invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Email received.
    Email(InboundEmail),
    /// Filesystem change matched by a file-watch trigger.
    FileChanged {
        /// Trigger whose path and pattern matched.
        trigger_id: String,
        /// Changed file.
        path: String,
        /// `created`, `modified` or `removed`.
        event: String,
    },
}

/// Route one inbound event to its triggers and invoke them.
pub async fn handle_inbound(
    service: &TriggerService,
    event: InboundEvent,
) -> Result<Vec<TriggerInvocationRecord>> {
    match event {
        InboundEvent::Email(email) => {
            let triggers = service.email_triggers_for(&email.to).await?;
            if triggers.is_empty() {
                debug!(to = %email.to, "No email trigger for recipient");
                return Ok(Vec::new());
            }

            let payload = json!({
                "from": email.from,
                "to": email.to,
                "subject": email.subject,
                "body": email.body,
            });
            let ids: Vec<String> = triggers.into_iter().map(|t| t.id).collect();
            Ok(invoke_all(service, &ids, &payload).await)
        }
        InboundEvent::FileChanged {
            trigger_id,
            path,
            event,
        } => {
            let invocation = service
                .invoke(
                    &trigger_id,
                    InvokeRequest::with_payload(json!({"path": path, "event": event})),
                )
                .await?;
            Ok(vec![invocation])
        }
    }
}

/// Invoke every trigger with the same payload. A trigger whose invocation
/// fails is logged and skipped; the others are still invoked.
pub async fn invoke_all(
    service: &TriggerService,
    trigger_ids: &[String],
    payload: &Value,
) -> Vec<TriggerInvocationRecord> {
    let mut invocations = Vec::with_capacity(trigger_ids.len());
    for trigger_id in trigger_ids {
        match service
            .invoke(trigger_id, InvokeRequest::with_payload(payload.clone()))
            .await
        {
            Ok(invocation) => invocations.push(invocation),
            Err(e) => warn!(trigger_id = %trigger_id, error = %e, "Failed to invoke trigger"),
        }
    }
    invocations
}

/// Drain the inbox until shutdown or until every sender is dropped.
///
/// A failing event is logged and does not stop the loop.
pub async fn run_inbox(
    service: Arc<TriggerService>,
    mut inbox: mpsc::Receiver<InboundEvent>,
    shutdown: Arc<Notify>,
) {
    info!("Trigger inbox started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                info!("Trigger inbox received shutdown signal");
                break;
            }
            event = inbox.recv() => {
                let Some(event) = event else {
                    info!("Trigger inbox closed");
                    break;
                };
                if let Err(e) = handle_inbound(&service, event).await {
                    error!(error = %e, "Failed to handle inbound trigger event");
                }
            }
        }
    }
}
