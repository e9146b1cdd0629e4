// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery of instances abandoned mid-processing.
//!
//! A processor that crashes between claim and terminal write leaves its rows
//! in PROCESSING. Once such a row is older than the stuck timeout it goes back
//! to PENDING and will be claimed again, so a receiver may see a delivery
//! twice.

use std::time::Duration;

use sqlx::PgPool;
use tracing::{debug, info};

use crate::db;
use crate::error::Result;

/// Reset PROCESSING instances untouched for longer than `stuck_timeout`.
///
/// Age is measured with the database clock. Returns the reset instance IDs.
pub async fn recover_stuck_triggers(pool: &PgPool, stuck_timeout: Duration) -> Result<Vec<String>> {
    let stuck_secs = i64::try_from(stuck_timeout.as_secs()).unwrap_or(i64::MAX);
    let reset = db::reset_stuck_processing(pool, stuck_secs).await?;

    if reset.is_empty() {
        debug!("No stuck triggers found");
    } else {
        info!(
            count = reset.len(),
            stuck_timeout_secs = stuck_secs,
            "Reset stuck triggers to PENDING"
        );
    }

    Ok(reset)
}
