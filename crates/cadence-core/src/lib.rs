// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadence Core - State Store
//!
//! This crate owns the durable record of everything the orchestration engine
//! does: imported actions, runs, schedules and their execution attempts,
//! triggers and their invocations. The engine (`cadence-engine`) reads all of
//! its scheduling state from here, which is what makes it restart-safe.
//!
//! # Tables
//!
//! | Table | Written by | Notes |
//! |-------|------------|-------|
//! | `actions` | package import | read-only to the engine except `enabled` |
//! | `runs` | orchestrator | terminal status written once via compare-and-set |
//! | `schedules` | management API, scheduler | scheduler owns `last_run_at` / `next_run_at` |
//! | `schedule_executions` | scheduler | one row per attempt, retries get a new row |
//! | `triggers` | management API | invocation counters bumped on acceptance |
//! | `trigger_invocations` | trigger gateway | ACCEPTED / REJECTED / RATE_LIMITED / ERROR |
//!
//! # Run lifecycle
//!
//! ```text
//!            start_run
//!   (absent) ─────────► RUNNING ──┬──► PASSED
//!                                 ├──► FAILED
//!                                 └──► CANCELLED
//! ```
//!
//! Terminal transitions go through
//! [`Persistence::complete_run_if_running`](persistence::Persistence::complete_run_if_running),
//! an `UPDATE ... WHERE status = 'RUNNING'` that reports whether it applied.
//! Exactly one of two racing writers (worker completion vs cancel) wins.
//!
//! # Backends
//!
//! SQLite is the only backend. [`persistence::SqlitePersistence::from_path`]
//! creates the file, enables WAL and runs the embedded migrations;
//! [`persistence::SqlitePersistence::in_memory`] is meant for tests.

#![deny(missing_docs)]

/// Error types for state store operations.
pub mod error;

/// Embedded SQL migrations.
pub mod migrations;

/// Record types, the persistence trait and the SQLite backend.
pub mod persistence;

/// Status and kind enums persisted as TEXT.
pub mod status;

pub use error::{CoreError, Result};
pub use persistence::{Persistence, SqlitePersistence};
