// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live run events.
//!
//! The bus keeps a bounded snapshot of recent runs and fans out changes over a
//! tokio broadcast channel. Publishing and subscribing both take the snapshot
//! lock, so a new subscriber's `runs_collected` snapshot and its stream line up
//! exactly: every change is either already in the snapshot or arrives on the
//! stream, never both.

use std::collections::VecDeque;

use cadence_core::persistence::RunRecord;
use cadence_core::status::{OriginKind, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Default broadcast buffer per subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Run fields pushed to live observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run id.
    pub id: String,
    /// Human-friendly run number.
    pub numbered_id: i64,
    /// Action executed.
    pub action_id: String,
    /// Current status.
    pub status: RunStatus,
    /// Who started the run.
    pub origin_kind: OriginKind,
    /// Schedule or trigger id.
    pub origin_id: Option<String>,
    /// Caller correlation key.
    pub request_id: Option<String>,
    /// Dispatch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Duration in seconds.
    pub duration_seconds: Option<f64>,
    /// Error message for failed and cancelled runs.
    pub error: Option<String>,
}

impl From<&RunRecord> for RunSummary {
    fn from(run: &RunRecord) -> Self {
        Self {
            id: run.id.clone(),
            numbered_id: run.numbered_id,
            action_id: run.action_id.clone(),
            status: run.status,
            origin_kind: run.origin_kind,
            origin_id: run.origin_id.clone(),
            request_id: run.request_id.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_seconds: run.duration_seconds,
            error: run.error.clone(),
        }
    }
}

/// Messages on the live run stream, tagged by `message_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum RunEvent {
    /// Full snapshot, sent once to each new subscriber.
    RunsCollected {
        /// Recent runs, oldest first.
        runs: Vec<RunSummary>,
    },
    /// A run appeared.
    RunAdded {
        /// The new run.
        run: RunSummary,
    },
    /// Some fields of a known run changed.
    RunChanged {
        /// Run that changed.
        run_id: String,
        /// Changed fields with their new values.
        changes: Map<String, Value>,
    },
    /// The action set was reloaded.
    MtimeChanged {
        /// Reload time.
        mtime: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Wire name of the message.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::RunsCollected { .. } => "runs_collected",
            Self::RunAdded { .. } => "run_added",
            Self::RunChanged { .. } => "run_changed",
            Self::MtimeChanged { .. } => "mtime_changed",
        }
    }
}

/// Errors observed by a subscriber.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The subscriber fell behind and events were dropped. Re-subscribe to
    /// get a fresh snapshot.
    #[error("subscriber lagged behind by {0} events, re-subscribe for a fresh snapshot")]
    Lagged(u64),

    /// The bus was dropped.
    #[error("event bus closed")]
    Closed,
}

/// Live subscription. The first message is always `runs_collected`.
pub struct RunEventSubscription {
    snapshot: Option<Vec<RunSummary>>,
    receiver: broadcast::Receiver<RunEvent>,
}

impl RunEventSubscription {
    /// Receive the next message.
    pub async fn recv(&mut self) -> Result<RunEvent, SubscriptionError> {
        if let Some(runs) = self.snapshot.take() {
            return Ok(RunEvent::RunsCollected { runs });
        }
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }

    /// Receive without waiting. `Ok(None)` when nothing is pending.
    pub fn try_recv(&mut self) -> Result<Option<RunEvent>, SubscriptionError> {
        if let Some(runs) = self.snapshot.take() {
            return Ok(Some(RunEvent::RunsCollected { runs }));
        }
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(SubscriptionError::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(SubscriptionError::Closed),
        }
    }
}

struct Snapshot {
    runs: VecDeque<RunSummary>,
    limit: usize,
}

impl Snapshot {
    fn position(&self, run_id: &str) -> Option<usize> {
        self.runs.iter().position(|r| r.id == run_id)
    }

    fn push(&mut self, run: RunSummary) {
        self.runs.push_back(run);
        while self.runs.len() > self.limit {
            self.runs.pop_front();
        }
    }

    fn apply(&mut self, event: &RunEvent) {
        match event {
            RunEvent::RunsCollected { runs } => {
                self.runs = runs.iter().cloned().collect();
                while self.runs.len() > self.limit {
                    self.runs.pop_front();
                }
            }
            RunEvent::RunAdded { run } => match self.position(&run.id) {
                Some(pos) => self.runs[pos] = run.clone(),
                None => self.push(run.clone()),
            },
            RunEvent::RunChanged { run_id, changes } => {
                let Some(pos) = self.position(run_id) else {
                    return;
                };
                let Ok(Value::Object(mut fields)) = serde_json::to_value(&self.runs[pos]) else {
                    return;
                };
                for (key, value) in changes {
                    fields.insert(key.clone(), value.clone());
                }
                if let Ok(updated) = serde_json::from_value(Value::Object(fields)) {
                    self.runs[pos] = updated;
                }
            }
            RunEvent::MtimeChanged { .. } => {}
        }
    }
}

/// Field-level diff between two summaries of the same run.
fn diff(old: &RunSummary, new: &RunSummary) -> Map<String, Value> {
    let (Ok(Value::Object(old)), Ok(Value::Object(new))) =
        (serde_json::to_value(old), serde_json::to_value(new))
    else {
        return Map::new();
    };
    new.into_iter()
        .filter(|(key, value)| old.get(key) != Some(value))
        .collect()
}

fn all_fields(summary: &RunSummary) -> Map<String, Value> {
    match serde_json::to_value(summary) {
        Ok(Value::Object(mut fields)) => {
            fields.remove("id");
            fields
        }
        _ => Map::new(),
    }
}

/// In-memory run event fan-out.
pub struct EventBus {
    snapshot: Mutex<Snapshot>,
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// Create a bus keeping at most `snapshot_limit` runs in its snapshot.
    pub fn new(snapshot_limit: usize) -> Self {
        Self::with_capacity(snapshot_limit, DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a bus with an explicit per-subscriber buffer.
    pub fn with_capacity(snapshot_limit: usize, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            snapshot: Mutex::new(Snapshot {
                runs: VecDeque::new(),
                limit: snapshot_limit.max(1),
            }),
            sender,
        }
    }

    /// Replace the snapshot with runs loaded from the store, oldest first.
    /// Nothing is broadcast.
    pub async fn seed(&self, runs: &[RunRecord]) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.apply(&RunEvent::RunsCollected {
            runs: runs.iter().map(RunSummary::from).collect(),
        });
        debug!(runs = snapshot.runs.len(), "Seeded run event snapshot");
    }

    /// Apply an event to the snapshot and broadcast it.
    pub async fn publish(&self, event: RunEvent) {
        let mut snapshot = self.snapshot.lock().await;
        snapshot.apply(&event);
        // No receivers is not an error.
        let _ = self.sender.send(event);
    }

    /// Publish the current state of a run: `run_added` the first time the bus
    /// sees it, `run_changed` with the differing fields afterwards.
    ///
    /// A finished run missing from the snapshot was evicted by the size limit,
    /// so it is reported as `run_changed` carrying every field and is not
    /// re-added.
    pub async fn record_run(&self, run: &RunRecord) {
        let summary = RunSummary::from(run);
        let mut snapshot = self.snapshot.lock().await;

        let event = match snapshot.position(&summary.id) {
            Some(pos) => {
                let changes = diff(&snapshot.runs[pos], &summary);
                if changes.is_empty() {
                    return;
                }
                RunEvent::RunChanged {
                    run_id: summary.id.clone(),
                    changes,
                }
            }
            None if run.status.is_terminal() => RunEvent::RunChanged {
                run_id: summary.id.clone(),
                changes: all_fields(&summary),
            },
            None => RunEvent::RunAdded { run: summary },
        };

        debug!(run_id = %run.id, message_type = event.message_type(), "Publishing run event");
        snapshot.apply(&event);
        let _ = self.sender.send(event);
    }

    /// Signal that the action set was reloaded.
    pub async fn publish_mtime_changed(&self, mtime: DateTime<Utc>) {
        self.publish(RunEvent::MtimeChanged { mtime }).await;
    }

    /// Subscribe. The returned stream starts with a `runs_collected` snapshot.
    pub async fn subscribe(&self) -> RunEventSubscription {
        let snapshot = self.snapshot.lock().await;
        RunEventSubscription {
            snapshot: Some(snapshot.runs.iter().cloned().collect()),
            receiver: self.sender.subscribe(),
        }
    }

    /// Current snapshot, oldest first.
    pub async fn snapshot(&self) -> Vec<RunSummary> {
        self.snapshot.lock().await.runs.iter().cloned().collect()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::persistence::Json;
    use serde_json::json;

    fn run(id: &str, numbered_id: i64, status: RunStatus) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            numbered_id,
            action_id: "pkg.echo".to_string(),
            status,
            origin_kind: OriginKind::Api,
            origin_id: None,
            request_id: None,
            input: Json(json!({})),
            result: None,
            error: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            artifacts_dir: None,
            started_at: Some(Utc::now()),
            finished_at: None,
            duration_seconds: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_first_message_is_snapshot() {
        let bus = EventBus::new(10);
        bus.record_run(&run("r1", 1, RunStatus::Running)).await;

        let mut sub = bus.subscribe().await;
        match sub.recv().await.unwrap() {
            RunEvent::RunsCollected { runs } => {
                assert_eq!(runs.len(), 1);
                assert_eq!(runs[0].status, RunStatus::Running);
            }
            other => panic!("expected runs_collected, got {:?}", other),
        }
        assert_eq!(sub.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn test_added_then_changed_with_diff() {
        let bus = EventBus::new(10);
        let mut sub = bus.subscribe().await;
        assert!(matches!(
            sub.recv().await.unwrap(),
            RunEvent::RunsCollected { runs } if runs.is_empty()
        ));

        let mut record = run("r1", 1, RunStatus::Running);
        bus.record_run(&record).await;
        record.status = RunStatus::Passed;
        record.duration_seconds = Some(1.5);
        bus.record_run(&record).await;
        // Unchanged state publishes nothing.
        bus.record_run(&record).await;

        assert!(matches!(sub.recv().await.unwrap(), RunEvent::RunAdded { run } if run.id == "r1"));
        match sub.recv().await.unwrap() {
            RunEvent::RunChanged { run_id, changes } => {
                assert_eq!(run_id, "r1");
                assert_eq!(changes.get("status"), Some(&json!("PASSED")));
                assert_eq!(changes.get("duration_seconds"), Some(&json!(1.5)));
                assert!(!changes.contains_key("action_id"));
            }
            other => panic!("expected run_changed, got {:?}", other),
        }
        assert_eq!(sub.try_recv().unwrap(), None);

        assert_eq!(bus.snapshot().await[0].status, RunStatus::Passed);
    }

    #[tokio::test]
    async fn test_snapshot_limit() {
        let bus = EventBus::new(2);
        for n in 1..=3 {
            bus.record_run(&run(&format!("r{}", n), n, RunStatus::Running))
                .await;
        }
        let ids: Vec<String> = bus.snapshot().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r2", "r3"]);
    }

    #[tokio::test]
    async fn test_evicted_run_is_changed_not_re_added() {
        let bus = EventBus::new(1);
        let mut first = run("r1", 1, RunStatus::Running);
        bus.record_run(&first).await;
        bus.record_run(&run("r2", 2, RunStatus::Running)).await;

        let mut sub = bus.subscribe().await;
        sub.recv().await.unwrap();

        first.status = RunStatus::Failed;
        first.finished_at = Some(Utc::now());
        bus.record_run(&first).await;

        match sub.recv().await.unwrap() {
            RunEvent::RunChanged { run_id, changes } => {
                assert_eq!(run_id, "r1");
                assert_eq!(changes.get("status"), Some(&json!("FAILED")));
                assert!(!changes.contains_key("id"));
            }
            other => panic!("expected run_changed, got {:?}", other),
        }
        let ids: Vec<String> = bus.snapshot().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r2"]);
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::with_capacity(10, 2);
        let mut sub = bus.subscribe().await;
        sub.recv().await.unwrap();

        for n in 0..5 {
            bus.publish_mtime_changed(Utc::now() + chrono::Duration::seconds(n))
                .await;
        }

        assert!(matches!(sub.recv().await, Err(SubscriptionError::Lagged(_))));
    }

    #[test]
    fn test_wire_format() {
        let event = RunEvent::RunChanged {
            run_id: "r1".into(),
            changes: Map::from_iter([("status".to_string(), json!("FAILED"))]),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["message_type"], "run_changed");
        assert_eq!(value["changes"]["status"], "FAILED");
        assert_eq!(event.message_type(), "run_changed");
    }
}
