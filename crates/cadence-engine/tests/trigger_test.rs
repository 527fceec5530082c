// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger gateway tests: admission, rate limits, payload merge, inbound routing.

mod common;

use cadence_core::status::{InvocationStatus, OriginKind, RunStatus, TriggerType};
use cadence_engine::triggers::auth::sign_body;
use cadence_engine::triggers::inbox::{handle_inbound, invoke_all};
use cadence_engine::triggers::{InboundEmail, InboundEvent, InvokeRequest, TriggerSpec};
use common::{ECHO_ACTION, TestContext};
use serde_json::json;

fn webhook(name: &str) -> TriggerSpec {
    TriggerSpec::new(name, TriggerType::Webhook, ECHO_ACTION)
}

#[tokio::test]
async fn test_accepted_invocation_merges_payload() {
    let ctx = TestContext::new().await;
    let trigger = ctx
        .triggers
        .create(TriggerSpec {
            inputs_template: json!({"region": "eu", "mode": "full"}),
            ..webhook("orders")
        })
        .await
        .unwrap();

    let invocation = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest {
                source_ip: Some("10.0.0.7".into()),
                method: Some("post".into()),
                ..InvokeRequest::with_payload(json!({"mode": "delta", "order": 17}))
            },
        )
        .await
        .unwrap();
    assert_eq!(invocation.status, InvocationStatus::Accepted);
    assert_eq!(invocation.source_ip.as_deref(), Some("10.0.0.7"));
    ctx.settle().await;

    let run = ctx
        .orchestrator
        .get_run(invocation.run_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Passed);
    assert_eq!(run.origin_kind, OriginKind::Trigger);
    assert_eq!(run.origin_id.as_deref(), Some(trigger.id.as_str()));
    assert_eq!(
        run.input.0,
        json!({"region": "eu", "mode": "delta", "order": 17})
    );

    let trigger = ctx.triggers.get(&trigger.id).await.unwrap();
    assert_eq!(trigger.invocation_count, 1);
    assert!(trigger.last_invoked_at.is_some());
}

#[tokio::test]
async fn test_rate_limit_per_minute() {
    let ctx = TestContext::new().await;
    let trigger = ctx
        .triggers
        .create(TriggerSpec {
            rate_limit_max_per_minute: Some(3),
            ..webhook("burst")
        })
        .await
        .unwrap();

    let mut statuses = Vec::new();
    for i in 0..4 {
        let invocation = ctx
            .triggers
            .invoke(&trigger.id, InvokeRequest::with_payload(json!({"n": i})))
            .await
            .unwrap();
        statuses.push(invocation.status);
    }
    assert_eq!(
        statuses,
        vec![
            InvocationStatus::Accepted,
            InvocationStatus::Accepted,
            InvocationStatus::Accepted,
            InvocationStatus::RateLimited,
        ]
    );
    ctx.settle().await;

    let trigger = ctx.triggers.get(&trigger.id).await.unwrap();
    assert_eq!(trigger.invocation_count, 3);
}

#[tokio::test]
async fn test_webhook_secret_and_signature() {
    let ctx = TestContext::new().await;
    let trigger = ctx
        .triggers
        .create(TriggerSpec {
            webhook_secret: Some("s3cret".into()),
            ..webhook("signed")
        })
        .await
        .unwrap();

    let body = br#"{"event":"push"}"#.to_vec();
    let signed = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest {
                credential: Some(sign_body("s3cret", &body)),
                raw_body: Some(body.clone()),
                ..InvokeRequest::with_payload(json!({"event": "push"}))
            },
        )
        .await
        .unwrap();
    assert_eq!(signed.status, InvocationStatus::Accepted);

    let plain = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest {
                credential: Some("s3cret".into()),
                ..InvokeRequest::with_payload(json!({}))
            },
        )
        .await
        .unwrap();
    assert_eq!(plain.status, InvocationStatus::Accepted);

    let wrong = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest {
                credential: Some("guess".into()),
                ..InvokeRequest::with_payload(json!({}))
            },
        )
        .await
        .unwrap();
    assert_eq!(wrong.status, InvocationStatus::Rejected);
    assert!(wrong.run_id.is_none());

    let missing = ctx
        .triggers
        .invoke(&trigger.id, InvokeRequest::with_payload(json!({})))
        .await
        .unwrap();
    assert_eq!(missing.status, InvocationStatus::Rejected);

    let tampered = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest {
                credential: Some(sign_body("s3cret", &body)),
                raw_body: Some(br#"{"event":"delete"}"#.to_vec()),
                ..InvokeRequest::with_payload(json!({"event": "delete"}))
            },
        )
        .await
        .unwrap();
    assert_eq!(tampered.status, InvocationStatus::Rejected);
    ctx.settle().await;
}

#[tokio::test]
async fn test_disabled_and_wrong_method_rejected() {
    let ctx = TestContext::new().await;
    let trigger = ctx
        .triggers
        .create(TriggerSpec {
            webhook_method: Some("put".into()),
            ..webhook("strict")
        })
        .await
        .unwrap();
    assert_eq!(trigger.webhook_method.as_deref(), Some("PUT"));

    let wrong_method = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest {
                method: Some("POST".into()),
                ..InvokeRequest::with_payload(json!({}))
            },
        )
        .await
        .unwrap();
    assert_eq!(wrong_method.status, InvocationStatus::Rejected);

    ctx.triggers.set_enabled(&trigger.id, false).await.unwrap();
    let disabled = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest {
                method: Some("PUT".into()),
                ..InvokeRequest::with_payload(json!({}))
            },
        )
        .await
        .unwrap();
    assert_eq!(disabled.status, InvocationStatus::Rejected);
    assert_eq!(disabled.error_message.as_deref(), Some("trigger is disabled"));

    assert!(ctx.executor.launched().await.is_empty());
}

#[tokio::test]
async fn test_start_failure_recorded_as_error() {
    let ctx = TestContext::new().await;
    ctx.import(
        "pkg.strict",
        Some(json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}},
            "required": ["count"]
        })),
    )
    .await;
    let trigger = ctx
        .triggers
        .create(TriggerSpec::new("typed", TriggerType::Webhook, "pkg.strict"))
        .await
        .unwrap();

    let invocation = ctx
        .triggers
        .invoke(
            &trigger.id,
            InvokeRequest::with_payload(json!({"count": "many"})),
        )
        .await
        .unwrap();
    assert_eq!(invocation.status, InvocationStatus::Error);
    assert!(invocation.error_message.is_some());
    assert!(invocation.run_id.is_none());
}

#[tokio::test]
async fn test_unknown_trigger_not_found() {
    let ctx = TestContext::new().await;
    let err = ctx
        .triggers
        .invoke("missing", InvokeRequest::with_payload(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_email_routed_to_matching_triggers() {
    let ctx = TestContext::new().await;
    let inbox = ctx
        .triggers
        .create(TriggerSpec {
            email_address: Some("Invoices@Example.com".into()),
            inputs_template: json!({"source": "mail"}),
            ..TriggerSpec::new("invoices", TriggerType::Email, ECHO_ACTION)
        })
        .await
        .unwrap();
    ctx.triggers
        .create(TriggerSpec {
            email_address: Some("other@example.com".into()),
            ..TriggerSpec::new("other", TriggerType::Email, ECHO_ACTION)
        })
        .await
        .unwrap();

    let invocations = handle_inbound(
        &ctx.triggers,
        InboundEvent::Email(InboundEmail {
            from: "billing@vendor.test".into(),
            to: "invoices@example.com".into(),
            subject: "Invoice 12".into(),
            body: "see attachment".into(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].trigger_id, inbox.id);
    assert_eq!(invocations[0].status, InvocationStatus::Accepted);
    ctx.settle().await;

    let run = ctx
        .orchestrator
        .get_run(invocations[0].run_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        run.input.0,
        json!({
            "source": "mail",
            "from": "billing@vendor.test",
            "to": "invoices@example.com",
            "subject": "Invoice 12",
            "body": "see attachment"
        })
    );

    let nobody = handle_inbound(
        &ctx.triggers,
        InboundEvent::Email(InboundEmail {
            from: "a@b.test".into(),
            to: "nobody@example.com".into(),
            subject: String::new(),
            body: String::new(),
        }),
    )
    .await
    .unwrap();
    assert!(nobody.is_empty());
}

#[tokio::test]
async fn test_failed_invocation_does_not_stop_the_rest() {
    let ctx = TestContext::new().await;
    let live = ctx
        .triggers
        .create(TriggerSpec {
            email_address: Some("ops@example.com".into()),
            ..TriggerSpec::new("ops", TriggerType::Email, ECHO_ACTION)
        })
        .await
        .unwrap();

    let ids = vec!["deleted-trigger".to_string(), live.id.clone()];
    let invocations = invoke_all(&ctx.triggers, &ids, &json!({"subject": "hi"})).await;
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].trigger_id, live.id);
    assert_eq!(invocations[0].status, InvocationStatus::Accepted);
    ctx.settle().await;
}

#[tokio::test]
async fn test_file_change_invokes_trigger() {
    let ctx = TestContext::new().await;
    let watch_dir = ctx.data_dir.join("incoming");
    let trigger = ctx
        .triggers
        .create(TriggerSpec {
            watch_path: Some(watch_dir.to_string_lossy().into_owned()),
            watch_pattern: Some("*.csv".into()),
            watch_events: vec!["created".into()],
            ..TriggerSpec::new("drops", TriggerType::FileWatch, ECHO_ACTION)
        })
        .await
        .unwrap();
    assert_eq!(ctx.triggers.file_watch_triggers().await.unwrap().len(), 1);

    let path = watch_dir.join("orders.csv").to_string_lossy().into_owned();
    let invocations = handle_inbound(
        &ctx.triggers,
        InboundEvent::FileChanged {
            trigger_id: trigger.id.clone(),
            path: path.clone(),
            event: "created".into(),
        },
    )
    .await
    .unwrap();
    assert_eq!(invocations[0].status, InvocationStatus::Accepted);
    ctx.settle().await;

    let run = ctx
        .orchestrator
        .get_run(invocations[0].run_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.input.0, json!({"path": path, "event": "created"}));
}

#[tokio::test]
async fn test_validation_errors() {
    let ctx = TestContext::new().await;

    let cases = vec![
        TriggerSpec::new("", TriggerType::Webhook, ECHO_ACTION),
        TriggerSpec::new("ghost", TriggerType::Webhook, "pkg.missing"),
        TriggerSpec {
            inputs_template: json!([1, 2]),
            ..webhook("array")
        },
        TriggerSpec {
            webhook_method: Some("TRACE".into()),
            ..webhook("trace")
        },
        TriggerSpec {
            webhook_secret: Some(String::new()),
            ..webhook("blank-secret")
        },
        TriggerSpec {
            rate_limit_max_per_minute: Some(0),
            ..webhook("zero")
        },
        TriggerSpec {
            email_address: Some("not-an-address".into()),
            ..TriggerSpec::new("mail", TriggerType::Email, ECHO_ACTION)
        },
        TriggerSpec::new("files", TriggerType::FileWatch, ECHO_ACTION),
        TriggerSpec {
            watch_path: Some("/tmp".into()),
            watch_events: vec!["renamed".into()],
            ..TriggerSpec::new("files", TriggerType::FileWatch, ECHO_ACTION)
        },
        TriggerSpec {
            watch_path: Some("/tmp".into()),
            watch_pattern: Some("[".into()),
            ..TriggerSpec::new("files", TriggerType::FileWatch, ECHO_ACTION)
        },
    ];

    for spec in cases {
        let name = spec.name.clone();
        let err = ctx.triggers.create(spec).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error", "case {:?}", name);
    }
    assert!(ctx.triggers.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_delete_and_history() {
    let ctx = TestContext::new().await;
    let trigger = ctx.triggers.create(webhook("hooks")).await.unwrap();

    for _ in 0..2 {
        ctx.triggers
            .invoke(&trigger.id, InvokeRequest::with_payload(json!({})))
            .await
            .unwrap();
    }
    ctx.settle().await;

    let updated = ctx
        .triggers
        .update(
            &trigger.id,
            TriggerSpec {
                inputs_template: json!({"v": 2}),
                ..webhook("hooks-v2")
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name, "hooks-v2");
    assert_eq!(updated.invocation_count, 2);

    let history = ctx
        .triggers
        .list_invocations(&trigger.id, 10, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|i| i.status == InvocationStatus::Accepted));

    ctx.triggers.delete(&trigger.id).await.unwrap();
    let err = ctx.triggers.delete(&trigger.id).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
    let err = ctx
        .triggers
        .list_invocations(&trigger.id, 10, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}
