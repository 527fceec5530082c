// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle tests against the in-memory store and the mock executor.

mod common;

use std::time::Duration;

use cadence_core::persistence::{ListRunsFilter, NewRun};
use cadence_core::status::{OriginKind, RunStatus};
use cadence_engine::events::RunEvent;
use cadence_engine::orchestrator::{CancelRunRequest, ORPHANED_RUN_ERROR, StartRunRequest};
use cadence_engine::runner::MockExecutor;
use chrono::Utc;
use common::{ECHO_ACTION, TestContext};
use serde_json::json;

#[tokio::test]
async fn test_start_run_returns_running_then_passes() {
    let ctx = TestContext::new().await;

    let run = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({"name": "ada"})))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_eq!(run.origin_kind, OriginKind::Api);
    assert!(run.started_at.is_some());
    assert!(run.finished_at.is_none());

    ctx.settle().await;

    let run = ctx.orchestrator.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    assert_eq!(run.result.unwrap().0, json!({"echo": {"name": "ada"}}));
    assert!(run.finished_at.is_some());
    assert!(run.duration_seconds.is_some());

    let log = ctx
        .data_dir
        .join(run.artifacts_dir.unwrap())
        .join("output.log");
    let contents = tokio::fs::read_to_string(log).await.unwrap();
    assert!(contents.contains("mock output"));
}

#[tokio::test]
async fn test_numbered_ids_increase() {
    let ctx = TestContext::new().await;
    let first = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap();
    let second = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap();
    assert_eq!(second.numbered_id, first.numbered_id + 1);
    ctx.settle().await;
}

#[tokio::test]
async fn test_failing_action_records_failed() {
    let ctx = TestContext::with_executor(MockExecutor::failing()).await;

    let run = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap();
    ctx.settle().await;

    let run = ctx.orchestrator.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Mock failure"));
}

#[tokio::test]
async fn test_invalid_input_creates_no_run() {
    let ctx = TestContext::new().await;
    ctx.import(
        "pkg.greet",
        Some(json!({
            "type": "object",
            "properties": {"name": {"type": "string"}},
            "required": ["name"]
        })),
    )
    .await;

    let err = ctx
        .orchestrator
        .start_run(StartRunRequest::api("pkg.greet", json!({"name": 3})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let runs = ctx
        .orchestrator
        .list_runs(&ListRunsFilter::default())
        .await
        .unwrap();
    assert!(runs.is_empty());
    assert!(ctx.executor.launched().await.is_empty());
}

#[tokio::test]
async fn test_unknown_and_disabled_actions() {
    let ctx = TestContext::new().await;

    let err = ctx
        .orchestrator
        .start_run(StartRunRequest::api("pkg.missing", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    ctx.persistence
        .set_action_enabled(ECHO_ACTION, false)
        .await
        .unwrap();
    let err = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");
}

#[tokio::test]
async fn test_double_cancel_transitions_once() {
    let ctx = TestContext::with_executor(MockExecutor::never_completing()).await;

    let run = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        ctx.orchestrator
            .cancel_run(CancelRunRequest::by_run_id(run.id.clone())),
        ctx.orchestrator
            .cancel_run(CancelRunRequest::by_run_id(run.id.clone())),
    );
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|c| **c).count(), 1);

    tokio::time::timeout(Duration::from_secs(5), ctx.settle())
        .await
        .expect("cancelled run task should finish");

    let run = ctx.orchestrator.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error.as_deref(), Some("cancelled by user"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_as_soon_as_run_appears_stops_execution() {
    let ctx = TestContext::with_executor(MockExecutor::never_completing()).await;
    let mut sub = ctx.events.subscribe().await;
    sub.recv().await.unwrap();

    // Cancel the moment the row is announced, racing the dispatch.
    let orchestrator = ctx.orchestrator.clone();
    let canceller = tokio::spawn(async move {
        loop {
            if let RunEvent::RunAdded { run } = sub.recv().await.unwrap() {
                return orchestrator
                    .cancel_run(CancelRunRequest::by_run_id(run.id))
                    .await
                    .unwrap();
            }
        }
    });

    let run = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap();
    assert!(canceller.await.unwrap());

    tokio::time::timeout(Duration::from_secs(5), ctx.settle())
        .await
        .expect("no execution may outlive its cancellation");
    assert_eq!(ctx.executor.active_count().await, 0);

    let run = ctx.orchestrator.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_by_request_id_with_reason() {
    let ctx = TestContext::with_executor(MockExecutor::never_completing()).await;

    let run = ctx
        .orchestrator
        .start_run(StartRunRequest {
            request_id: Some("req-42".into()),
            ..StartRunRequest::api(ECHO_ACTION, json!({}))
        })
        .await
        .unwrap();

    let cancelled = ctx
        .orchestrator
        .cancel_run(CancelRunRequest {
            run_id: None,
            request_id: Some("req-42".into()),
            reason: Some("operator stop".into()),
        })
        .await
        .unwrap();
    assert!(cancelled);
    ctx.settle().await;

    let run = ctx.orchestrator.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.error.as_deref(), Some("operator stop"));
}

#[tokio::test]
async fn test_cancel_terminal_run_is_noop() {
    let ctx = TestContext::new().await;

    let run = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap();
    ctx.settle().await;

    let cancelled = ctx
        .orchestrator
        .cancel_run(CancelRunRequest::by_run_id(run.id.clone()))
        .await
        .unwrap();
    assert!(!cancelled);

    let run = ctx.orchestrator.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Passed);
}

#[tokio::test]
async fn test_cancel_requires_an_id() {
    let ctx = TestContext::new().await;

    let err = ctx
        .orchestrator
        .cancel_run(CancelRunRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation_error");

    let err = ctx
        .orchestrator
        .cancel_run(CancelRunRequest::by_run_id("nope"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_recover_orphaned_runs() {
    let ctx = TestContext::new().await;

    ctx.persistence
        .insert_run(&NewRun {
            id: "orphan-1".into(),
            action_id: ECHO_ACTION.into(),
            status: RunStatus::Running,
            origin_kind: OriginKind::Api,
            origin_id: None,
            request_id: None,
            input: json!({}),
            artifacts_dir: None,
            started_at: Some(Utc::now()),
        })
        .await
        .unwrap();

    assert_eq!(ctx.orchestrator.recover_orphaned_runs().await.unwrap(), 1);
    assert_eq!(ctx.orchestrator.recover_orphaned_runs().await.unwrap(), 0);

    let run = ctx.orchestrator.get_run("orphan-1").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(ORPHANED_RUN_ERROR));
}

#[tokio::test]
async fn test_runs_are_published() {
    let ctx = TestContext::new().await;

    let run = ctx
        .orchestrator
        .start_run(StartRunRequest::api(ECHO_ACTION, json!({})))
        .await
        .unwrap();
    ctx.settle().await;

    let snapshot = ctx.events.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, run.id);
    assert_eq!(snapshot[0].status, RunStatus::Passed);
}
