// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cadence-engine.
//!
//! [`EngineRuntime`] wires the orchestrator, scheduler, trigger gateway and
//! event bus together and runs their background loops inside an existing
//! tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cadence_core::SqlitePersistence;
//! use cadence_engine::runner::{ProcessPool, ProcessPoolConfig};
//! use cadence_engine::runtime::EngineRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/cadence.db").await?);
//!     let pool = Arc::new(ProcessPool::new(ProcessPoolConfig::new("action-host")));
//!
//!     let runtime = EngineRuntime::builder()
//!         .persistence(persistence)
//!         .executor(pool)
//!         .data_dir(".data")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve runtime.state() over HTTP ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use cadence_core::Persistence;
use cadence_core::persistence::ListRunsFilter;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::events::EventBus;
use crate::handlers::HandlerState;
use crate::notifier::{LogNotifier, Notifier};
use crate::orchestrator::Orchestrator;
use crate::registry::{ActionRegistry, StoreActionRegistry};
use crate::runner::Executor;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::schedules::ScheduleService;
use crate::triggers::{InboundEmail, InboundEvent, TriggerService, inbox, watcher};

/// Builder for creating an [`EngineRuntime`].
pub struct EngineRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    executor: Option<Arc<dyn Executor>>,
    registry: Option<Arc<dyn ActionRegistry>>,
    notifier: Option<Arc<dyn Notifier>>,
    data_dir: PathBuf,
    scheduler_tick: Duration,
    maintenance_interval: Duration,
    event_snapshot_limit: usize,
    inbox_capacity: usize,
    file_watch: bool,
    shutdown_grace: Duration,
}

impl Default for EngineRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            executor: None,
            registry: None,
            notifier: None,
            data_dir: PathBuf::from(".data"),
            scheduler_tick: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(5),
            event_snapshot_limit: 500,
            inbox_capacity: 256,
            file_watch: true,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl EngineRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the knobs loaded by [`Config::from_env`].
    pub fn config(mut self, config: &Config) -> Self {
        self.data_dir = config.data_dir.clone();
        self.scheduler_tick = config.scheduler_tick;
        self.event_snapshot_limit = config.event_snapshot_limit;
        self
    }

    /// Set the state store (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the executor running actions (required).
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the action registry.
    ///
    /// Default: reads the `actions` table of the state store.
    pub fn registry(mut self, registry: Arc<dyn ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the schedule notifier.
    ///
    /// Default: [`LogNotifier`]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the artifact root.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Set the scheduler tick.
    ///
    /// Default: 5 seconds
    pub fn scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    /// Set how often the executor reclaims idle workers and tops up the
    /// minimum.
    ///
    /// Default: 5 seconds
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the number of runs kept in the live event snapshot.
    ///
    /// Default: 500
    pub fn event_snapshot_limit(mut self, limit: usize) -> Self {
        self.event_snapshot_limit = limit;
        self
    }

    /// Enable or disable the file-watch source.
    ///
    /// Default: enabled
    pub fn file_watch(mut self, enabled: bool) -> Self {
        self.file_watch = enabled;
        self
    }

    /// Set how long shutdown waits for in-flight runs.
    ///
    /// Default: 30 seconds
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<EngineRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor is required"))?;
        if self.scheduler_tick.is_zero() || self.maintenance_interval.is_zero() {
            anyhow::bail!("scheduler_tick and maintenance_interval must be positive");
        }

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(StoreActionRegistry::new(persistence.clone())));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        Ok(EngineRuntimeConfig {
            persistence,
            executor,
            registry,
            notifier,
            data_dir: self.data_dir,
            scheduler_tick: self.scheduler_tick,
            maintenance_interval: self.maintenance_interval,
            event_snapshot_limit: self.event_snapshot_limit,
            inbox_capacity: self.inbox_capacity.max(1),
            file_watch: self.file_watch,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// Configuration for an [`EngineRuntime`].
pub struct EngineRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    executor: Arc<dyn Executor>,
    registry: Arc<dyn ActionRegistry>,
    notifier: Arc<dyn Notifier>,
    data_dir: PathBuf,
    scheduler_tick: Duration,
    maintenance_interval: Duration,
    event_snapshot_limit: usize,
    inbox_capacity: usize,
    file_watch: bool,
    shutdown_grace: Duration,
}

impl EngineRuntimeConfig {
    /// Recover state left by a previous process and start the background
    /// loops.
    pub async fn start(self) -> Result<EngineRuntime> {
        tokio::fs::create_dir_all(&self.data_dir).await?;

        let events = Arc::new(EventBus::new(self.event_snapshot_limit));
        let orchestrator = Arc::new(Orchestrator::new(
            self.persistence.clone(),
            self.registry.clone(),
            self.executor.clone(),
            events.clone(),
            self.data_dir.clone(),
        ));

        // Must run before anything is dispatched.
        let recovered = orchestrator.recover_orphaned_runs().await?;
        if recovered > 0 {
            warn!(recovered, "Failed runs orphaned by a previous process");
        }

        let mut recent = self
            .persistence
            .list_runs(&ListRunsFilter {
                limit: Some(self.event_snapshot_limit as i64),
                ..ListRunsFilter::default()
            })
            .await?;
        recent.reverse();
        events.seed(&recent).await;

        self.executor.maintain().await;
        let pool = self.executor.stats().await;
        info!(
            executor = self.executor.executor_type(),
            idle = pool.idle,
            min = pool.min_processes,
            max = pool.max_processes,
            "Executor ready"
        );

        let scheduler = Arc::new(Scheduler::new(
            self.persistence.clone(),
            orchestrator.clone(),
            self.notifier.clone(),
            SchedulerConfig {
                tick: self.scheduler_tick,
            },
        ));
        let schedules = Arc::new(ScheduleService::new(
            self.persistence.clone(),
            scheduler.clone(),
        ));
        let triggers = Arc::new(TriggerService::new(
            self.persistence.clone(),
            orchestrator.clone(),
        ));

        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(async move {
            scheduler.run().await;
        });

        let maintenance_shutdown = Arc::new(Notify::new());
        let maintenance_handle = tokio::spawn(run_maintenance(
            self.executor.clone(),
            self.maintenance_interval,
            maintenance_shutdown.clone(),
        ));

        let (inbox_tx, inbox_rx) = mpsc::channel(self.inbox_capacity);
        let inbox_shutdown = Arc::new(Notify::new());
        let inbox_handle = tokio::spawn(inbox::run_inbox(
            triggers.clone(),
            inbox_rx,
            inbox_shutdown.clone(),
        ));

        let watch_shutdown = Arc::new(Notify::new());
        let watch_handle = self.file_watch.then(|| {
            tokio::spawn(watcher::run_file_watch(
                triggers.clone(),
                inbox_tx.clone(),
                watch_shutdown.clone(),
            ))
        });

        let state = Arc::new(HandlerState::new(
            self.persistence.clone(),
            orchestrator.clone(),
            schedules,
            triggers,
        ));

        info!(
            data_dir = %self.data_dir.display(),
            tick_ms = self.scheduler_tick.as_millis() as u64,
            file_watch = self.file_watch,
            "EngineRuntime started"
        );

        Ok(EngineRuntime {
            scheduler_handle,
            maintenance_handle,
            inbox_handle,
            watch_handle,
            scheduler_shutdown,
            maintenance_shutdown,
            inbox_shutdown,
            watch_shutdown,
            inbox: inbox_tx,
            orchestrator,
            executor: self.executor,
            state,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// A running engine embedded in an application.
///
/// The runtime manages:
/// - Scheduler tick loop
/// - Executor maintenance (idle reclaim, minimum top-up)
/// - Trigger inbox for email and file-watch events
/// - File-watch source (optional)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct EngineRuntime {
    scheduler_handle: JoinHandle<()>,
    maintenance_handle: JoinHandle<()>,
    inbox_handle: JoinHandle<()>,
    watch_handle: Option<JoinHandle<()>>,
    scheduler_shutdown: Arc<Notify>,
    maintenance_shutdown: Arc<Notify>,
    inbox_shutdown: Arc<Notify>,
    watch_shutdown: Arc<Notify>,
    inbox: mpsc::Sender<InboundEvent>,
    orchestrator: Arc<Orchestrator>,
    executor: Arc<dyn Executor>,
    state: Arc<HandlerState>,
    shutdown_grace: Duration,
}

impl EngineRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> EngineRuntimeBuilder {
        EngineRuntimeBuilder::new()
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<HandlerState> {
        &self.state
    }

    /// Sender for inbound trigger events.
    pub fn inbox(&self) -> mpsc::Sender<InboundEvent> {
        self.inbox.clone()
    }

    /// Hand a parsed email to the trigger inbox.
    pub async fn deliver_email(&self, email: InboundEmail) -> Result<()> {
        self.inbox
            .send(InboundEvent::Email(email))
            .await
            .map_err(|_| anyhow::anyhow!("trigger inbox is closed"))
    }

    /// Check if every background loop is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished()
            && !self.maintenance_handle.is_finished()
            && !self.inbox_handle.is_finished()
            && self.watch_handle.as_ref().is_none_or(|h| !h.is_finished())
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the loops, closes the executor to new work and waits up to the
    /// shutdown grace for in-flight runs. Runs still RUNNING afterwards are
    /// failed as orphans on the next start.
    pub async fn shutdown(self) -> Result<()> {
        info!("EngineRuntime shutting down...");

        self.scheduler_shutdown.notify_one();
        self.maintenance_shutdown.notify_one();
        self.inbox_shutdown.notify_one();
        self.watch_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Scheduler task panicked: {}", e);
        }
        if let Err(e) = self.maintenance_handle.await {
            error!("Maintenance task panicked: {}", e);
        }
        if let Err(e) = self.inbox_handle.await {
            error!("Trigger inbox task panicked: {}", e);
        }
        if let Some(handle) = self.watch_handle
            && let Err(e) = handle.await
        {
            error!("File watch task panicked: {}", e);
        }

        self.executor.shutdown().await;

        if tokio::time::timeout(self.shutdown_grace, self.orchestrator.wait_idle())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.orchestrator.in_flight(),
                "Runs still executing at shutdown"
            );
        }

        info!("EngineRuntime shutdown complete");
        Ok(())
    }
}

async fn run_maintenance(executor: Arc<dyn Executor>, interval: Duration, shutdown: Arc<Notify>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => {
                info!("Executor maintenance received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                executor.maintain().await;
            }
        }
    }
}
