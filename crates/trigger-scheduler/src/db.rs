// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database operations for trigger-scheduler.
//!
//! The scheduler owns three tables:
//! - `data_streams`: destinations (read-only here apart from `is_streaming`)
//! - `trigger_schedules`: persisted rules, mutated only by the reconciler
//! - `scheduled_triggers`: the shared queue every processor claims from
//!
//! Functions take any Postgres executor so they can run against the pool or
//! inside a caller's transaction.

use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::model::{CancelReason, Destination, PersistedRule, ScheduledTrigger, TriggerRule};

/// Column list for `scheduled_triggers` reads and `RETURNING` clauses.
const TRIGGER_COLUMNS: &str = "id, destination_id, rule_id, record_id, table_id, \
     original_field_id, scheduled_time, original_time, retry_count, max_retries, \
     next_retry_time, last_error, state, status, deleted_time, last_modified_time";

const RULE_COLUMNS: &str =
    "id, destination_id, field_id, trigger_type, offset_minutes, name, status, deleted_time";

const DESTINATION_COLUMNS: &str =
    "id, table_id, name, webhook_url, strategy, is_streaming, signing_secret, deleted_time";

// ============================================================================
// Destinations
// ============================================================================

/// Get a non-deleted destination by ID.
pub async fn get_destination(
    executor: impl PgExecutor<'_>,
    destination_id: &str,
) -> Result<Option<Destination>, sqlx::Error> {
    let query = format!(
        "SELECT {} FROM data_streams WHERE id = $1 AND deleted_time IS NULL",
        DESTINATION_COLUMNS
    );
    sqlx::query_as::<_, Destination>(&query)
        .bind(destination_id)
        .fetch_optional(executor)
        .await
}

/// Find TIME_BASED destinations attached to a table, optionally scoped to one destination.
pub async fn find_time_based_destinations(
    executor: impl PgExecutor<'_>,
    table_id: &str,
    destination_id: Option<&str>,
) -> Result<Vec<Destination>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {}
        FROM data_streams
        WHERE table_id = $1
          AND strategy = 'TIME_BASED'
          AND deleted_time IS NULL
          AND ($2::TEXT IS NULL OR id = $2)
        ORDER BY created_time ASC
        "#,
        DESTINATION_COLUMNS
    );
    sqlx::query_as::<_, Destination>(&query)
        .bind(table_id)
        .bind(destination_id)
        .fetch_all(executor)
        .await
}

/// Record whether a destination is streaming.
pub async fn set_destination_streaming(
    executor: impl PgExecutor<'_>,
    destination_id: &str,
    is_streaming: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE data_streams
        SET is_streaming = $2, last_modified_time = NOW()
        WHERE id = $1 AND is_streaming IS DISTINCT FROM $2
        "#,
    )
    .bind(destination_id)
    .bind(is_streaming)
    .execute(executor)
    .await?;

    Ok(())
}

// ============================================================================
// Rules
// ============================================================================

/// List non-deleted rules of a destination.
pub async fn list_rules(
    executor: impl PgExecutor<'_>,
    destination_id: &str,
) -> Result<Vec<PersistedRule>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {}
        FROM trigger_schedules
        WHERE destination_id = $1 AND deleted_time IS NULL
        ORDER BY created_time ASC, id ASC
        "#,
        RULE_COLUMNS
    );
    sqlx::query_as::<_, PersistedRule>(&query)
        .bind(destination_id)
        .fetch_all(executor)
        .await
}

/// Get a non-deleted rule by ID.
pub async fn get_rule(
    executor: impl PgExecutor<'_>,
    rule_id: &str,
) -> Result<Option<PersistedRule>, sqlx::Error> {
    let query = format!(
        "SELECT {} FROM trigger_schedules WHERE id = $1 AND deleted_time IS NULL",
        RULE_COLUMNS
    );
    sqlx::query_as::<_, PersistedRule>(&query)
        .bind(rule_id)
        .fetch_optional(executor)
        .await
}

/// Active rules of the given destinations, optionally scoped to one rule.
pub async fn find_active_rules(
    executor: impl PgExecutor<'_>,
    destination_ids: &[String],
    rule_id: Option<&str>,
) -> Result<Vec<PersistedRule>, sqlx::Error> {
    if destination_ids.is_empty() {
        return Ok(Vec::new());
    }

    let query = format!(
        r#"
        SELECT {}
        FROM trigger_schedules
        WHERE destination_id = ANY($1)
          AND status = 'active'
          AND deleted_time IS NULL
          AND ($2::TEXT IS NULL OR id = $2)
        ORDER BY created_time ASC, id ASC
        "#,
        RULE_COLUMNS
    );
    sqlx::query_as::<_, PersistedRule>(&query)
        .bind(destination_ids)
        .bind(rule_id)
        .fetch_all(executor)
        .await
}

/// Count active rules of a destination.
pub async fn count_active_rules(
    executor: impl PgExecutor<'_>,
    destination_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM trigger_schedules
        WHERE destination_id = $1 AND status = 'active' AND deleted_time IS NULL
        "#,
    )
    .bind(destination_id)
    .fetch_one(executor)
    .await
}

/// Insert an active rule and return it.
pub async fn insert_rule(
    executor: impl PgExecutor<'_>,
    destination_id: &str,
    rule: &TriggerRule,
) -> Result<PersistedRule, sqlx::Error> {
    let query = format!(
        r#"
        INSERT INTO trigger_schedules (id, destination_id, field_id, trigger_type, offset_minutes, name, status)
        VALUES ($1, $2, $3, $4, $5, $6, 'active')
        RETURNING {}
        "#,
        RULE_COLUMNS
    );
    sqlx::query_as::<_, PersistedRule>(&query)
        .bind(Uuid::new_v4().to_string())
        .bind(destination_id)
        .bind(&rule.field_id)
        .bind(rule.trigger_type.as_str())
        .bind(rule.offset_minutes)
        .bind(&rule.name)
        .fetch_one(executor)
        .await
}

/// Overwrite a rule's editable attributes. Returns false if the rule is gone.
pub async fn update_rule(
    executor: impl PgExecutor<'_>,
    rule_id: &str,
    rule: &TriggerRule,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE trigger_schedules
        SET field_id = $2, trigger_type = $3, offset_minutes = $4, name = $5,
            last_modified_time = NOW()
        WHERE id = $1 AND deleted_time IS NULL
        "#,
    )
    .bind(rule_id)
    .bind(&rule.field_id)
    .bind(rule.trigger_type.as_str())
    .bind(rule.offset_minutes)
    .bind(&rule.name)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Soft-delete a rule. Returns false if it was already gone.
pub async fn soft_delete_rule(
    executor: impl PgExecutor<'_>,
    rule_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE trigger_schedules
        SET status = 'inactive', deleted_time = NOW(), last_modified_time = NOW()
        WHERE id = $1 AND deleted_time IS NULL
        "#,
    )
    .bind(rule_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Scheduled instances: creation and cancellation
// ============================================================================

/// Values for a new PENDING instance.
#[derive(Debug, Clone)]
pub struct NewScheduledTrigger {
    /// Destination receiving the webhook.
    pub destination_id: String,
    /// Rule producing the instance.
    pub rule_id: String,
    /// Record the instance fires for.
    pub record_id: String,
    /// Table of the record.
    pub table_id: String,
    /// Field the fire time was derived from.
    pub original_field_id: String,
    /// Fire time.
    pub scheduled_time: DateTime<Utc>,
    /// Field value the fire time was derived from.
    pub original_time: DateTime<Utc>,
    /// Attempts allowed.
    pub max_retries: i32,
}

/// Insert a PENDING instance and return its ID.
pub async fn insert_scheduled_trigger(
    executor: impl PgExecutor<'_>,
    new: &NewScheduledTrigger,
) -> Result<String, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO scheduled_triggers (
            id, destination_id, rule_id, record_id, table_id, original_field_id,
            scheduled_time, original_time, retry_count, max_retries, state, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, 'PENDING', 'active')
        "#,
    )
    .bind(&id)
    .bind(&new.destination_id)
    .bind(&new.rule_id)
    .bind(&new.record_id)
    .bind(&new.table_id)
    .bind(&new.original_field_id)
    .bind(new.scheduled_time)
    .bind(new.original_time)
    .bind(new.max_retries)
    .execute(executor)
    .await?;

    Ok(id)
}

/// Cancel every active instance of a `(rule, record)` pair, whatever its state.
///
/// A row held by a processor's transaction blocks this statement until the
/// processor commits; a row that turned terminal meanwhile no longer matches.
pub async fn cancel_active_for_rule_record(
    executor: impl PgExecutor<'_>,
    rule_id: &str,
    record_id: &str,
    reason: CancelReason,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_triggers
        SET state = 'CANCELLED', status = 'inactive', last_error = $3,
            next_retry_time = NULL, deleted_time = NOW(), last_modified_time = NOW()
        WHERE rule_id = $1 AND record_id = $2 AND status = 'active'
        "#,
    )
    .bind(rule_id)
    .bind(record_id)
    .bind(reason.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Cancel PENDING instances of deleted records. PROCESSING rows are left alone.
pub async fn cancel_pending_for_records(
    executor: impl PgExecutor<'_>,
    table_id: &str,
    record_ids: &[String],
    reason: CancelReason,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_triggers
        SET state = 'CANCELLED', status = 'inactive', last_error = $3,
            deleted_time = NOW(), last_modified_time = NOW()
        WHERE table_id = $1 AND record_id = ANY($2)
          AND status = 'active' AND state = 'PENDING'
        "#,
    )
    .bind(table_id)
    .bind(record_ids)
    .bind(reason.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Cancel active instances of a rule that are not mid-delivery.
///
/// Covers PENDING rows and FAILED rows awaiting a retry, since both carry a
/// fire time derived from the rule as it was.
pub async fn cancel_idle_for_rule(
    executor: impl PgExecutor<'_>,
    rule_id: &str,
    reason: CancelReason,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_triggers
        SET state = 'CANCELLED', status = 'inactive', last_error = $2,
            next_retry_time = NULL, deleted_time = NOW(), last_modified_time = NOW()
        WHERE rule_id = $1 AND status = 'active' AND state IN ('PENDING', 'FAILED')
        "#,
    )
    .bind(rule_id)
    .bind(reason.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Scheduled instances: claiming and transitions
// ============================================================================

/// Claim due PENDING instances, moving them to PROCESSING.
///
/// `FOR UPDATE SKIP LOCKED` lets concurrent processors claim disjoint sets.
/// The result is ordered by `scheduled_time` ascending.
pub async fn claim_ready(
    executor: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    batch_size: i64,
) -> Result<Vec<ScheduledTrigger>, sqlx::Error> {
    let query = format!(
        r#"
        UPDATE scheduled_triggers
        SET state = 'PROCESSING', last_modified_time = NOW()
        WHERE id IN (
            SELECT id FROM scheduled_triggers
            WHERE status = 'active' AND state = 'PENDING' AND scheduled_time <= $1
            ORDER BY scheduled_time ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {}
        "#,
        TRIGGER_COLUMNS
    );
    let mut claimed = sqlx::query_as::<_, ScheduledTrigger>(&query)
        .bind(now)
        .bind(batch_size)
        .fetch_all(executor)
        .await?;
    claimed.sort_by_key(|t| t.scheduled_time);
    Ok(claimed)
}

/// Claim FAILED instances whose retry time has come, moving them to PROCESSING.
///
/// The result is ordered by `next_retry_time` ascending.
pub async fn claim_retries(
    executor: impl PgExecutor<'_>,
    now: DateTime<Utc>,
    batch_size: i64,
) -> Result<Vec<ScheduledTrigger>, sqlx::Error> {
    let query = format!(
        r#"
        UPDATE scheduled_triggers
        SET state = 'PROCESSING', last_modified_time = NOW()
        WHERE id IN (
            SELECT id FROM scheduled_triggers
            WHERE status = 'active' AND state = 'FAILED'
              AND next_retry_time <= $1
              AND retry_count < max_retries
            ORDER BY next_retry_time ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {}
        "#,
        TRIGGER_COLUMNS
    );
    let mut claimed = sqlx::query_as::<_, ScheduledTrigger>(&query)
        .bind(now)
        .bind(batch_size)
        .fetch_all(executor)
        .await?;
    claimed.sort_by_key(|t| t.next_retry_time);
    Ok(claimed)
}

/// Lock a claimed instance for the duration of the caller's transaction.
///
/// Touches `last_modified_time` so the stuck timeout counts from the moment
/// work starts, not from the claim. Returns `None` when the row is no longer
/// an active PROCESSING instance (superseded or reset since it was claimed).
pub async fn lock_processing(
    executor: impl PgExecutor<'_>,
    trigger_id: &str,
) -> Result<Option<ScheduledTrigger>, sqlx::Error> {
    let query = format!(
        r#"
        UPDATE scheduled_triggers
        SET last_modified_time = NOW()
        WHERE id = $1 AND status = 'active' AND state = 'PROCESSING'
        RETURNING {}
        "#,
        TRIGGER_COLUMNS
    );
    sqlx::query_as::<_, ScheduledTrigger>(&query)
        .bind(trigger_id)
        .fetch_optional(executor)
        .await
}

/// PROCESSING -> FIRED, soft-deleting the row.
pub async fn mark_fired(executor: impl PgExecutor<'_>, trigger_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE scheduled_triggers
        SET state = 'FIRED', status = 'inactive', last_error = NULL, next_retry_time = NULL,
            deleted_time = NOW(), last_modified_time = NOW()
        WHERE id = $1 AND state = 'PROCESSING'
        "#,
    )
    .bind(trigger_id)
    .execute(executor)
    .await?;

    Ok(())
}

/// PROCESSING -> CANCELLED with the reason recorded in `last_error`.
pub async fn mark_cancelled(
    executor: impl PgExecutor<'_>,
    trigger_id: &str,
    reason: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE scheduled_triggers
        SET state = 'CANCELLED', status = 'inactive', last_error = $2, next_retry_time = NULL,
            deleted_time = NOW(), last_modified_time = NOW()
        WHERE id = $1 AND state = 'PROCESSING'
        "#,
    )
    .bind(trigger_id)
    .bind(reason)
    .execute(executor)
    .await?;

    Ok(())
}

/// PROCESSING -> FAILED, staying active until `next_retry_time`.
pub async fn schedule_retry(
    executor: impl PgExecutor<'_>,
    trigger_id: &str,
    retry_count: i32,
    last_error: &str,
    next_retry_time: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE scheduled_triggers
        SET state = 'FAILED', retry_count = $2, last_error = $3, next_retry_time = $4,
            last_modified_time = NOW()
        WHERE id = $1 AND state = 'PROCESSING'
        "#,
    )
    .bind(trigger_id)
    .bind(retry_count)
    .bind(last_error)
    .bind(next_retry_time)
    .execute(executor)
    .await?;

    Ok(())
}

/// PROCESSING -> terminal FAILED, soft-deleting the row.
pub async fn mark_failed_terminal(
    executor: impl PgExecutor<'_>,
    trigger_id: &str,
    retry_count: i32,
    last_error: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE scheduled_triggers
        SET state = 'FAILED', status = 'inactive', retry_count = $2, last_error = $3,
            next_retry_time = NULL, deleted_time = NOW(), last_modified_time = NOW()
        WHERE id = $1 AND state = 'PROCESSING'
        "#,
    )
    .bind(trigger_id)
    .bind(retry_count)
    .bind(last_error)
    .execute(executor)
    .await?;

    Ok(())
}

/// Reset instances stuck in PROCESSING for longer than `stuck_after_secs` back to PENDING.
///
/// Returns the IDs that were reset.
pub async fn reset_stuck_processing(
    executor: impl PgExecutor<'_>,
    stuck_after_secs: i64,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        UPDATE scheduled_triggers
        SET state = 'PENDING', last_modified_time = NOW()
        WHERE state = 'PROCESSING'
          AND status = 'active'
          AND last_modified_time < NOW() - make_interval(secs => $1::DOUBLE PRECISION)
        RETURNING id
        "#,
    )
    .bind(stuck_after_secs)
    .fetch_all(executor)
    .await
}

// ============================================================================
// Scheduled instances: reads, retention and stats
// ============================================================================

/// Get an instance by ID, including terminal ones.
pub async fn get_scheduled_trigger(
    executor: impl PgExecutor<'_>,
    trigger_id: &str,
) -> Result<Option<ScheduledTrigger>, sqlx::Error> {
    let query = format!("SELECT {} FROM scheduled_triggers WHERE id = $1", TRIGGER_COLUMNS);
    sqlx::query_as::<_, ScheduledTrigger>(&query)
        .bind(trigger_id)
        .fetch_optional(executor)
        .await
}

/// All instances (live and retired) for one `(rule, record)` pair, oldest first.
pub async fn list_triggers_for_rule_record(
    executor: impl PgExecutor<'_>,
    rule_id: &str,
    record_id: &str,
) -> Result<Vec<ScheduledTrigger>, sqlx::Error> {
    let query = format!(
        r#"
        SELECT {} FROM scheduled_triggers
        WHERE rule_id = $1 AND record_id = $2
        ORDER BY created_time ASC, id ASC
        "#,
        TRIGGER_COLUMNS
    );
    sqlx::query_as::<_, ScheduledTrigger>(&query)
        .bind(rule_id)
        .bind(record_id)
        .fetch_all(executor)
        .await
}

/// Hard-delete soft-deleted instances older than `cutoff`, at most `limit` rows.
pub async fn purge_deleted_before(
    executor: impl PgExecutor<'_>,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM scheduled_triggers
        WHERE id IN (
            SELECT id FROM scheduled_triggers
            WHERE deleted_time IS NOT NULL AND deleted_time < $1
            ORDER BY deleted_time ASC
            LIMIT $2
        )
        "#,
    )
    .bind(cutoff)
    .bind(limit)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Per-state instance counts for one destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerStats {
    /// Waiting to fire.
    pub pending: i64,
    /// Claimed and in flight.
    pub processing: i64,
    /// Delivered.
    pub fired: i64,
    /// Failed (awaiting retry or terminal).
    pub failed: i64,
    /// Cancelled.
    pub cancelled: i64,
}

/// Count instances per state for a destination.
pub async fn trigger_stats(
    executor: impl PgExecutor<'_>,
    destination_id: &str,
) -> Result<TriggerStats, sqlx::Error> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        r#"
        SELECT state, COUNT(*) FROM scheduled_triggers
        WHERE destination_id = $1
        GROUP BY state
        "#,
    )
    .bind(destination_id)
    .fetch_all(executor)
    .await?;

    let mut stats = TriggerStats::default();
    for (state, count) in rows {
        match state.as_str() {
            "PENDING" => stats.pending = count,
            "PROCESSING" => stats.processing = count,
            "FIRED" => stats.fired = count,
            "FAILED" => stats.failed = count,
            "CANCELLED" => stats.cancelled = count,
            _ => {}
        }
    }
    Ok(stats)
}
