// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadence Engine - Run Orchestration & Scheduling
//!
//! A long-running process responsible for:
//! - Worker process pool (spawn, reuse, cancel, reclaim)
//! - Run lifecycle (start, cancel, terminal compare-and-set)
//! - Schedules (cron, interval, weekday, once) with retries and limits
//! - Triggers (webhook, email, file-watch)

use std::sync::Arc;
use tracing::{info, warn};

use cadence_core::SqlitePersistence;
use cadence_engine::config::Config;
use cadence_engine::runner::{Executor, ProcessPool, ProcessPoolConfig};
use cadence_engine::runtime::EngineRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database = %config.database_path.display(),
        data_dir = %config.data_dir.display(),
        worker = %config.worker_command.join(" "),
        "Starting Cadence Engine"
    );

    if let Some(parent) = config.database_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let persistence = Arc::new(SqlitePersistence::from_path(&config.database_path).await?);
    info!("State store ready");

    let mut pool_config = ProcessPoolConfig::from_command(&config.worker_command)?;
    pool_config.min_processes = config.min_processes;
    pool_config.max_processes = config.max_processes;
    pool_config.reuse_processes = config.reuse_processes;
    pool_config.execution_timeout = config.execution_timeout;
    pool_config.idle_timeout = config.idle_timeout;
    let pool = Arc::new(ProcessPool::new(pool_config));
    info!(executor = pool.executor_type(), "Process pool initialized");

    let runtime = EngineRuntime::builder()
        .config(&config)
        .persistence(persistence)
        .executor(pool)
        .build()?
        .start()
        .await?;

    info!("Cadence Engine ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Cadence Engine shut down");

    Ok(())
}
