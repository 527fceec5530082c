// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cadence-engine integration tests.
//!
//! Provides TestContext wiring an in-memory store, a mock executor and every
//! engine service together.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use cadence_core::persistence::{ActionRecord, Json};
use cadence_core::{Persistence, SqlitePersistence};
use chrono::Utc;
use serde_json::{Value, json};

use cadence_engine::events::EventBus;
use cadence_engine::notifier::MemoryNotifier;
use cadence_engine::orchestrator::Orchestrator;
use cadence_engine::registry::StoreActionRegistry;
use cadence_engine::runner::MockExecutor;
use cadence_engine::scheduler::{Scheduler, SchedulerConfig};
use cadence_engine::schedules::ScheduleService;
use cadence_engine::triggers::TriggerService;

/// Action every context imports, accepting any object.
pub const ECHO_ACTION: &str = "pkg.echo";

/// Test context sharing one store between all services.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub executor: Arc<MockExecutor>,
    pub events: Arc<EventBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub schedules: ScheduleService,
    pub triggers: TriggerService,
    pub notifier: Arc<MemoryNotifier>,
    pub data_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Context with a mock executor that passes after 10ms.
    pub async fn new() -> Self {
        Self::with_executor(MockExecutor::new()).await
    }

    /// Context with the given mock executor.
    pub async fn with_executor(executor: MockExecutor) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let data_dir = temp_dir.path().to_path_buf();

        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("in-memory store"),
        );
        persistence
            .import_action(&action(ECHO_ACTION, Some(json!({"type": "object"}))))
            .await
            .expect("import action");

        let executor = Arc::new(executor);
        let events = Arc::new(EventBus::new(100));
        let orchestrator = Arc::new(Orchestrator::new(
            persistence.clone(),
            Arc::new(StoreActionRegistry::new(persistence.clone())),
            executor.clone(),
            events.clone(),
            data_dir.clone(),
        ));
        let notifier = Arc::new(MemoryNotifier::new());
        let scheduler = Arc::new(Scheduler::new(
            persistence.clone(),
            orchestrator.clone(),
            notifier.clone(),
            SchedulerConfig::default(),
        ));
        let schedules = ScheduleService::new(persistence.clone(), scheduler.clone());
        let triggers = TriggerService::new(persistence.clone(), orchestrator.clone());

        Self {
            persistence,
            executor,
            events,
            orchestrator,
            scheduler,
            schedules,
            triggers,
            notifier,
            data_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Import another action.
    pub async fn import(&self, id: &str, schema: Option<Value>) {
        self.persistence
            .import_action(&action(id, schema))
            .await
            .expect("import action");
    }

    /// Wait until every dispatched run has written its outcome.
    pub async fn settle(&self) {
        self.orchestrator.wait_idle().await;
    }
}

/// Action record with the given input schema.
pub fn action(id: &str, input_schema: Option<Value>) -> ActionRecord {
    ActionRecord {
        id: id.to_string(),
        package_id: "pkg".to_string(),
        name: id.rsplit('.').next().unwrap_or(id).to_string(),
        entry_point: format!("{}:main", id),
        input_schema: input_schema.map(Json),
        output_schema: None,
        enabled: true,
        created_at: Utc::now(),
    }
}
