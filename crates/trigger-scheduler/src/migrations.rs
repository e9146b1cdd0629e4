// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for trigger-scheduler.
//!
//! Creates the three tables the scheduler owns (`data_streams`,
//! `trigger_schedules`, `scheduled_triggers`) plus the claim indexes.
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! trigger_scheduler::migrations::run(&pool).await?;
//! ```

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};

/// Migrations embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations.
pub async fn run(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}
