// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the embedded runtime and its handlers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cadence_core::persistence::NewRun;
use cadence_core::status::{InvocationStatus, OriginKind, RunStatus, ScheduleType, TriggerType};
use cadence_core::{Persistence, SqlitePersistence};
use cadence_engine::handlers::{
    PageQuery, StartRunBody, handle_create_schedule, handle_create_trigger, handle_get_run,
    handle_health_check, handle_import_actions, handle_list_executions, handle_list_invocations,
    handle_start_run,
};
use cadence_engine::orchestrator::ORPHANED_RUN_ERROR;
use cadence_engine::runner::MockExecutor;
use cadence_engine::runtime::EngineRuntime;
use cadence_engine::schedules::ScheduleSpec;
use cadence_engine::triggers::{InboundEmail, TriggerSpec};
use chrono::Utc;
use common::action;
use serde_json::json;

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn start_runtime(persistence: Arc<dyn Persistence>, data_dir: &std::path::Path) -> EngineRuntime {
    EngineRuntime::builder()
        .persistence(persistence)
        .executor(Arc::new(MockExecutor::new()))
        .data_dir(data_dir)
        .scheduler_tick(Duration::from_millis(50))
        .maintenance_interval(Duration::from_millis(50))
        .file_watch(false)
        .shutdown_grace(Duration::from_secs(5))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_build_requires_persistence_and_executor() {
    assert!(EngineRuntime::builder().build().is_err());
    assert!(
        EngineRuntime::builder()
            .executor(Arc::new(MockExecutor::new()))
            .build()
            .is_err()
    );
}

#[tokio::test]
async fn test_runtime_serves_runs_schedules_and_email() {
    let temp = tempfile::TempDir::new().unwrap();
    let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());

    // Left RUNNING by a previous process.
    persistence
        .import_action(&action("pkg.echo", None))
        .await
        .unwrap();
    persistence
        .insert_run(&NewRun {
            id: "stale".into(),
            action_id: "pkg.echo".into(),
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

    let runtime = start_runtime(persistence.clone(), temp.path()).await;
    assert!(runtime.is_running());
    let state = runtime.state().clone();

    let stale = handle_get_run(&state, "stale").await.unwrap();
    assert_eq!(stale.status, RunStatus::Failed);
    assert_eq!(stale.error.as_deref(), Some(ORPHANED_RUN_ERROR));

    handle_import_actions(&state, vec![action("pkg.report", Some(json!({"type": "object"})))])
        .await
        .unwrap();

    // On-demand run.
    let run = handle_start_run(
        &state,
        StartRunBody {
            action_id: "pkg.report".into(),
            input: Some(json!({"day": "mon"})),
            request_id: None,
            timeout_seconds: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    eventually(|| {
        let state = state.clone();
        let id = run.id.clone();
        async move {
            handle_get_run(&state, &id)
                .await
                .is_ok_and(|r| r.status == RunStatus::Passed)
        }
    })
    .await;

    // Scheduled run, fired by the background loop.
    let schedule = handle_create_schedule(
        &state,
        ScheduleSpec {
            run_once_at: Some(Utc::now()),
            ..ScheduleSpec::new("now", "pkg.report", ScheduleType::Once)
        },
    )
    .await
    .unwrap();
    eventually(|| {
        let state = state.clone();
        let id = schedule.id.clone();
        async move {
            handle_list_executions(&state, &id, PageQuery::default())
                .await
                .is_ok_and(|rows| rows.iter().any(|e| e.run_id.is_some()))
        }
    })
    .await;

    // Email delivered through the inbox.
    let trigger = handle_create_trigger(
        &state,
        TriggerSpec {
            email_address: Some("reports@example.com".into()),
            ..TriggerSpec::new("mail", TriggerType::Email, "pkg.report")
        },
    )
    .await
    .unwrap();
    runtime
        .deliver_email(InboundEmail {
            from: "someone@example.com".into(),
            to: "reports@example.com".into(),
            subject: "send report".into(),
            body: String::new(),
        })
        .await
        .unwrap();
    eventually(|| {
        let state = state.clone();
        let id = trigger.id.clone();
        async move {
            handle_list_invocations(&state, &id, PageQuery::default())
                .await
                .is_ok_and(|rows| {
                    rows.iter()
                        .any(|i| i.status == InvocationStatus::Accepted)
                })
        }
    })
    .await;

    let health = handle_health_check(&state).await.unwrap();
    assert!(health.healthy);

    runtime.shutdown().await.unwrap();
}
