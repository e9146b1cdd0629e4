// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fire-time arithmetic.
//!
//! All time computations used by the schedule computer and processor live
//! here so that the rules can be tested without a database.

use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::model::TriggerType;

/// Computed fire times older than this many seconds are skipped instead of scheduled.
pub const STALE_THRESHOLD_SECS: i64 = 60;

/// Maximum drift between the scheduled-from value and the current value.
pub const DRIFT_TOLERANCE_MS: i64 = 1000;

/// Base of the exponential retry backoff, in minutes.
pub const BACKOFF_BASE_MINUTES: i64 = 5;

/// Upper bound on a single backoff delay (one year).
const MAX_BACKOFF_MINUTES: i64 = 365 * 24 * 60;

/// Compute when a rule fires for a given timestamp.
///
/// EXACT fires at `timestamp`; BEFORE and AFTER shift it by `offset_minutes`.
pub fn calculate_scheduled_time(
    timestamp: Option<DateTime<Utc>>,
    trigger_type: TriggerType,
    offset_minutes: i32,
) -> Result<DateTime<Utc>> {
    let timestamp = timestamp.ok_or(Error::MissingTimestamp)?;
    let offset = Duration::minutes(i64::from(offset_minutes));

    Ok(match trigger_type {
        TriggerType::Exact => timestamp,
        TriggerType::Before => timestamp - offset,
        TriggerType::After => timestamp + offset,
    })
}

/// Whether a computed fire time lies too far in the past to be scheduled.
pub fn is_stale(scheduled_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    scheduled_time < now - Duration::seconds(STALE_THRESHOLD_SECS)
}

/// Whether the current field value still matches the value an instance was scheduled from.
pub fn timestamps_match(original: DateTime<Utc>, current: DateTime<Utc>) -> bool {
    (current - original).num_milliseconds().abs() <= DRIFT_TOLERANCE_MS
}

/// Delay before the next attempt after a failure at `retry_count`.
///
/// `5^(retry_count + 1)` minutes: 5, 25, 125, ...
pub fn retry_delay(retry_count: i32) -> Duration {
    let exponent = u32::try_from(retry_count.saturating_add(1)).unwrap_or(1);
    let minutes = BACKOFF_BASE_MINUTES
        .checked_pow(exponent)
        .map_or(MAX_BACKOFF_MINUTES, |m| m.min(MAX_BACKOFF_MINUTES));
    Duration::minutes(minutes)
}
