// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for cadence-core.
//!
//! This module exposes embedded migrations that can be run programmatically.
//! Products embedding the engine with their own pool can call [`run_sqlite`]
//! to set up the schema.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use cadence_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:.data/cadence.db?mode=rwc").await?;
//! migrations::run_sqlite(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all state store migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
