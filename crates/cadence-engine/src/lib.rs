// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadence Engine - Run Orchestration & Scheduling
//!
//! This crate executes named actions in isolated worker processes, either on
//! demand, on a schedule, or in response to external triggers, and streams
//! run changes to live subscribers. All durable state lives in `cadence-core`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 HTTP layer / mail collaborator                         │
//! └──────────────────────────────────────────────────────────────────────┘
//!            │ handlers                          │ inbox (mpsc)
//!            ▼                                   ▼
//! ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐
//! │  Schedules   │  │ Orchestrator │◄─│    Trigger Gateway      │
//! │  Scheduler   │─►│  start/cancel│  │ webhook / email / files │
//! └──────────────┘  └──────────────┘  └────────────────────────┘
//!                      │        │
//!          execute     ▼        ▼ run_added / run_changed
//!   ┌──────────────────────┐  ┌──────────────────────┐
//!   │   Process Pool        │  │      Event Bus        │
//!   │ min ≤ workers ≤ max   │  │ snapshot + broadcast  │
//!   └──────────────────────┘  └──────────────────────┘
//!              │
//!              ▼
//!   ┌──────────────────────────────────────────────┐
//!   │             SQLite state store                │
//!   │   (actions, runs, schedules, triggers)        │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! # Run Lifecycle
//!
//! `start_run` validates the input against the action's schema, writes a
//! RUNNING row and returns. A background task awaits the executor and writes
//! the terminal status with a compare-and-set against RUNNING, so a cancel
//! racing a completion produces exactly one terminal transition.
//!
//! # Worker Protocol
//!
//! Workers are long-lived or single-use OS processes speaking newline
//! delimited JSON on stdio. The pool writes one request per run:
//!
//! ```json
//! {"run_id": "...", "action": {"action_id": "...", "entry_point": "..."}, "input": {}, "artifacts_dir": "..."}
//! ```
//!
//! and waits for a reply line `{"status": "passed"|"failed", "result": ..., "error": ...}`.
//! Any other stdout line is captured as run output.
//!
//! # Schedules
//!
//! | Type | Fields | Next fire |
//! |------|--------|-----------|
//! | `cron` | `cron_expression`, `timezone` | next cron match in the timezone |
//! | `interval` | `interval_seconds` | previous `next_run_at` plus the interval |
//! | `weekday` | `weekdays`, `weekday_times`, `timezone` | next listed day and time |
//! | `once` | `run_once_at` | fires once, then disables itself |
//!
//! Before firing, the scheduler checks the dependency, then concurrency, then
//! rate limits; the first failing check records a SKIPPED execution.
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables read by the
//! `cadence-engine` binary.

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Live run event fan-out.
pub mod events;

/// Collaborator-facing request handlers.
pub mod handlers;

/// Schedule outcome notifications.
pub mod notifier;

/// Run state machine.
pub mod orchestrator;

/// Action lookup and input validation.
pub mod registry;

/// Execution backends (process pool, mock).
pub mod runner;

/// Embeddable runtime wiring every component together.
pub mod runtime;

/// Scheduler engine: due schedules, retries, timeouts.
pub mod scheduler;

/// Schedule management.
pub mod schedules;

/// Schedule fire-time computation.
pub mod timing;

/// Trigger gateway and event sources.
pub mod triggers;

pub use error::{Error, ErrorPayload, Result};
pub use events::{EventBus, RunEvent, RunEventSubscription};
pub use orchestrator::{CancelRunRequest, Orchestrator, RunOrigin, StartRunRequest};
pub use runtime::EngineRuntime;
