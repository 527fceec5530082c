// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for cadence-engine.

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Root for run artifact directories.
    pub data_dir: PathBuf,
    /// Worker program followed by its arguments.
    pub worker_command: Vec<String>,
    /// Workers kept alive even when idle.
    pub min_processes: usize,
    /// Hard cap on worker processes.
    pub max_processes: usize,
    /// Keep workers alive across invocations.
    pub reuse_processes: bool,
    /// Ceiling for a single invocation.
    pub execution_timeout: Duration,
    /// Idle workers above the minimum are reclaimed after this long.
    pub idle_timeout: Duration,
    /// Scheduler tick.
    pub scheduler_tick: Duration,
    /// Runs kept in the live event snapshot.
    pub event_snapshot_limit: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CADENCE_WORKER_COMMAND`: worker program and arguments, whitespace separated
    ///
    /// Optional (with defaults):
    /// - `CADENCE_DATABASE_PATH`: SQLite file (default: `.data/cadence.db`)
    /// - `CADENCE_DATA_DIR`: artifact root (default: `.data`)
    /// - `CADENCE_MIN_PROCESSES`: pool minimum (default: 1)
    /// - `CADENCE_MAX_PROCESSES`: pool maximum (default: 4)
    /// - `CADENCE_REUSE_PROCESSES`: reuse workers (default: false)
    /// - `CADENCE_EXECUTION_TIMEOUT_SECS`: invocation ceiling (default: 3600)
    /// - `CADENCE_IDLE_TIMEOUT_SECS`: idle reclaim grace (default: 60)
    /// - `CADENCE_SCHEDULER_TICK_SECS`: scheduler tick (default: 5)
    /// - `CADENCE_EVENT_SNAPSHOT_LIMIT`: runs in the live snapshot (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let worker_command: Vec<String> = std::env::var("CADENCE_WORKER_COMMAND")
            .map_err(|_| ConfigError::Missing("CADENCE_WORKER_COMMAND"))?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if worker_command.is_empty() {
            return Err(ConfigError::Invalid(
                "CADENCE_WORKER_COMMAND",
                "must name a program",
            ));
        }

        let data_dir = PathBuf::from(
            std::env::var("CADENCE_DATA_DIR").unwrap_or_else(|_| ".data".to_string()),
        );
        let database_path = std::env::var("CADENCE_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("cadence.db"));

        let min_processes = parse_var("CADENCE_MIN_PROCESSES", 1usize, "must be an integer")?;
        let max_processes =
            parse_var("CADENCE_MAX_PROCESSES", 4usize, "must be a positive integer")?;
        if max_processes == 0 {
            return Err(ConfigError::Invalid(
                "CADENCE_MAX_PROCESSES",
                "must be a positive integer",
            ));
        }
        if min_processes > max_processes {
            return Err(ConfigError::Invalid(
                "CADENCE_MIN_PROCESSES",
                "must not exceed CADENCE_MAX_PROCESSES",
            ));
        }

        let reuse_processes = std::env::var("CADENCE_REUSE_PROCESSES")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let execution_timeout = Duration::from_secs(parse_var(
            "CADENCE_EXECUTION_TIMEOUT_SECS",
            3600u64,
            "must be a number of seconds",
        )?);
        let idle_timeout = Duration::from_secs(parse_var(
            "CADENCE_IDLE_TIMEOUT_SECS",
            60u64,
            "must be a number of seconds",
        )?);
        let tick_secs: u64 = parse_var(
            "CADENCE_SCHEDULER_TICK_SECS",
            5u64,
            "must be a positive number of seconds",
        )?;
        if tick_secs == 0 {
            return Err(ConfigError::Invalid(
                "CADENCE_SCHEDULER_TICK_SECS",
                "must be a positive number of seconds",
            ));
        }
        let event_snapshot_limit = parse_var(
            "CADENCE_EVENT_SNAPSHOT_LIMIT",
            500usize,
            "must be an integer",
        )?;

        Ok(Self {
            database_path,
            data_dir,
            worker_command,
            min_processes,
            max_processes,
            reuse_processes,
            execution_timeout,
            idle_timeout,
            scheduler_tick: Duration::from_secs(tick_secs),
            event_snapshot_limit,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
