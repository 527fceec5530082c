// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule notifications.

use async_trait::async_trait;
use cadence_core::persistence::{ScheduleExecutionRecord, ScheduleRecord};
use cadence_core::status::ExecutionStatus;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Result;

/// Delivers schedule outcome notifications to a channel such as
/// `webhook:<url>` or `email:<addr>`.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one notification.
    async fn notify(
        &self,
        channel: &str,
        schedule: &ScheduleRecord,
        execution: &ScheduleExecutionRecord,
    ) -> Result<()>;
}

/// Notifier that only writes a log line per notification.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        channel: &str,
        schedule: &ScheduleRecord,
        execution: &ScheduleExecutionRecord,
    ) -> Result<()> {
        info!(
            channel = %channel,
            schedule_id = %schedule.id,
            schedule_name = %schedule.name,
            execution_id = %execution.id,
            attempt = execution.attempt,
            status = %execution.status,
            error_code = ?execution.error_code,
            "Schedule notification"
        );
        Ok(())
    }
}

/// A notification captured by [`MemoryNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    /// Channel notified.
    pub channel: String,
    /// Schedule the execution belongs to.
    pub schedule_id: String,
    /// Execution reported.
    pub execution_id: String,
    /// Execution status at send time.
    pub status: ExecutionStatus,
}

/// Notifier that keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<SentNotification>>,
}

impl MemoryNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications sent so far.
    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(
        &self,
        channel: &str,
        schedule: &ScheduleRecord,
        execution: &ScheduleExecutionRecord,
    ) -> Result<()> {
        self.sent.lock().await.push(SentNotification {
            channel: channel.to_string(),
            schedule_id: schedule.id.clone(),
            execution_id: execution.id.clone(),
            status: execution.status,
        });
        Ok(())
    }
}
