// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule computer.
//!
//! Turns record mutations into scheduled instances. For every applicable
//! `(record, rule)` pair the current timestamp is read, a fire time is
//! computed and any live instance for the pair is superseded by a fresh
//! PENDING one. Deleting a record cancels its PENDING instances.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::db::{self, NewScheduledTrigger};
use crate::error::{Error, Result};
use crate::model::{CancelReason, PersistedRule, RecordEvent, RecordEventType};
use crate::ports::{FieldInfo, Ports, TableInfo};
use crate::timing::{calculate_scheduled_time, is_stale};

/// Records per backfill chunk.
pub const BACKFILL_CHUNK_SIZE: i64 = 500;

/// Postgres `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// Counts from handling one record event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Instances inserted.
    pub scheduled: usize,
    /// Live instances cancelled (superseded or record deleted).
    pub cancelled: u64,
    /// Pairs skipped (null timestamp, stale fire time, unusable field).
    pub skipped: usize,
    /// Pairs that failed with an error.
    pub failed: usize,
}

/// Result of evaluating one `(record, rule)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairOutcome {
    Scheduled { superseded: u64 },
    Skipped,
}

/// Computes fire times and maintains one live instance per `(rule, record)`.
#[derive(Clone)]
pub struct ScheduleComputer {
    pool: PgPool,
    ports: Ports,
    max_retries: i32,
}

impl ScheduleComputer {
    /// Create a schedule computer. `max_retries` is stamped on new instances.
    pub fn new(pool: PgPool, ports: Ports, max_retries: i32) -> Self {
        Self {
            pool,
            ports,
            max_retries,
        }
    }

    /// React to a record mutation.
    pub async fn handle_event(&self, event: &RecordEvent) -> Result<ScheduleOutcome> {
        if event.record_ids.is_empty() {
            return Ok(ScheduleOutcome::default());
        }

        match event.event_type {
            RecordEventType::DeleteRecord => self.handle_delete(event).await,
            RecordEventType::CreateRecord | RecordEventType::UpdateRecord => {
                self.handle_upsert(event).await
            }
        }
    }

    /// Cancel PENDING instances of deleted records. In-flight deliveries are left alone.
    async fn handle_delete(&self, event: &RecordEvent) -> Result<ScheduleOutcome> {
        let cancelled = db::cancel_pending_for_records(
            &self.pool,
            &event.table_id,
            &event.record_ids,
            CancelReason::RecordDeleted,
        )
        .await?;

        if cancelled > 0 {
            info!(
                table_id = %event.table_id,
                records = event.record_ids.len(),
                cancelled = cancelled,
                "Cancelled triggers for deleted records"
            );
        }

        Ok(ScheduleOutcome {
            cancelled,
            ..Default::default()
        })
    }

    async fn handle_upsert(&self, event: &RecordEvent) -> Result<ScheduleOutcome> {
        let destinations = db::find_time_based_destinations(
            &self.pool,
            &event.table_id,
            event.destination_id.as_deref(),
        )
        .await?;
        if destinations.is_empty() {
            return Ok(ScheduleOutcome::default());
        }

        let destination_ids: Vec<String> = destinations.into_iter().map(|d| d.id).collect();
        let rules = db::find_active_rules(&self.pool, &destination_ids, event.rule_id.as_deref())
            .await?;
        let rules = applicable_rules(rules, event);
        if rules.is_empty() {
            return Ok(ScheduleOutcome::default());
        }

        let Some(table) = self.ports.tables.get_table(&event.table_id).await? else {
            warn!(table_id = %event.table_id, "Table not found, skipping scheduling");
            return Ok(ScheduleOutcome::default());
        };

        let mut field_ids: Vec<String> = rules.iter().map(|r| r.field_id.clone()).collect();
        field_ids.sort();
        field_ids.dedup();
        let fields: HashMap<String, FieldInfo> = self
            .ports
            .fields
            .get_fields(&table.id, &field_ids)
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();

        let mut outcome = ScheduleOutcome::default();

        for record_id in &event.record_ids {
            for rule in &rules {
                let Some(field) = fields.get(&rule.field_id) else {
                    debug!(rule_id = %rule.id, field_id = %rule.field_id, "Rule field deleted, skipping");
                    outcome.skipped += 1;
                    continue;
                };

                match self.schedule_pair(&table, field, rule, record_id).await {
                    Ok(PairOutcome::Scheduled { superseded }) => {
                        outcome.scheduled += 1;
                        outcome.cancelled += superseded;
                    }
                    Ok(PairOutcome::Skipped) => outcome.skipped += 1,
                    Err(e) => {
                        warn!(
                            rule_id = %rule.id,
                            record_id = %record_id,
                            error = %e,
                            "Failed to schedule trigger"
                        );
                        outcome.failed += 1;
                    }
                }
            }
        }

        debug!(
            table_id = %event.table_id,
            event_type = ?event.event_type,
            scheduled = outcome.scheduled,
            cancelled = outcome.cancelled,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "Handled record event"
        );

        Ok(outcome)
    }

    /// Compute and persist the instance for one `(record, rule)` pair.
    async fn schedule_pair(
        &self,
        table: &TableInfo,
        field: &FieldInfo,
        rule: &PersistedRule,
        record_id: &str,
    ) -> Result<PairOutcome> {
        if !field.is_timestamp() {
            warn!(
                rule_id = %rule.id,
                field_id = %field.id,
                field_type = %field.field_type,
                "Rule field is not a timestamp field"
            );
            return Ok(PairOutcome::Skipped);
        }

        let Some(original_time) = self
            .ports
            .records
            .read_timestamp(&table.db_table_name, record_id, &field.db_field_name)
            .await?
        else {
            return Ok(PairOutcome::Skipped);
        };

        let scheduled_time =
            calculate_scheduled_time(Some(original_time), rule.trigger_type, rule.offset_minutes)?;
        if is_stale(scheduled_time, Utc::now()) {
            debug!(
                rule_id = %rule.id,
                record_id = %record_id,
                scheduled_time = %scheduled_time,
                "Fire time already passed, not scheduling"
            );
            return Ok(PairOutcome::Skipped);
        }

        let new = NewScheduledTrigger {
            destination_id: rule.destination_id.clone(),
            rule_id: rule.id.clone(),
            record_id: record_id.to_string(),
            table_id: table.id.clone(),
            original_field_id: field.id.clone(),
            scheduled_time,
            original_time,
            max_retries: self.max_retries,
        };

        // A concurrent scheduler for the same pair can win the unique index;
        // one retry supersedes its row.
        let mut attempt = 0;
        loop {
            match self.supersede(&new).await {
                Err(Error::Database(sqlx::Error::Database(e)))
                    if attempt == 0 && e.code().as_deref() == Some(UNIQUE_VIOLATION) =>
                {
                    attempt += 1;
                }
                other => return other.map(|superseded| PairOutcome::Scheduled { superseded }),
            }
        }
    }

    /// Cancel the live instance for the pair and insert the new one atomically.
    async fn supersede(&self, new: &NewScheduledTrigger) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let superseded = db::cancel_active_for_rule_record(
            &mut *tx,
            &new.rule_id,
            &new.record_id,
            CancelReason::Superseded,
        )
        .await?;
        let id = db::insert_scheduled_trigger(&mut *tx, new).await?;

        tx.commit().await?;

        debug!(
            trigger_id = %id,
            rule_id = %new.rule_id,
            record_id = %new.record_id,
            scheduled_time = %new.scheduled_time,
            superseded = superseded,
            "Scheduled trigger"
        );

        Ok(superseded)
    }

    /// Re-evaluate every active record of the rule's table against one rule.
    ///
    /// Records are fed to [`handle_event`](Self::handle_event) in chunks of
    /// [`BACKFILL_CHUNK_SIZE`] as `create_record` events scoped to the rule.
    /// Returns the number of records evaluated.
    pub async fn backfill_rule(&self, rule_id: &str) -> Result<usize> {
        let rule = db::get_rule(&self.pool, rule_id)
            .await?
            .ok_or_else(|| Error::RuleNotFound(rule_id.to_string()))?;
        let destination = db::get_destination(&self.pool, &rule.destination_id)
            .await?
            .ok_or_else(|| Error::DestinationNotFound(rule.destination_id.clone()))?;

        let Some(table) = self.ports.tables.get_table(&destination.table_id).await? else {
            warn!(rule_id = %rule_id, table_id = %destination.table_id, "Table not found, nothing to backfill");
            return Ok(0);
        };

        let mut evaluated = 0;
        let mut totals = ScheduleOutcome::default();
        let mut after: Option<String> = None;

        loop {
            let record_ids = self
                .ports
                .records
                .list_record_ids(&table.db_table_name, after.as_deref(), BACKFILL_CHUNK_SIZE)
                .await?;
            let Some(last) = record_ids.last().cloned() else {
                break;
            };
            let chunk_len = record_ids.len();

            let event = RecordEvent {
                table_id: table.id.clone(),
                record_ids,
                event_type: RecordEventType::CreateRecord,
                updated_field_ids: Vec::new(),
                destination_id: Some(destination.id.clone()),
                rule_id: Some(rule.id.clone()),
            };
            let outcome = self.handle_event(&event).await?;

            evaluated += chunk_len;
            totals.scheduled += outcome.scheduled;
            totals.cancelled += outcome.cancelled;
            totals.skipped += outcome.skipped;
            totals.failed += outcome.failed;

            if (chunk_len as i64) < BACKFILL_CHUNK_SIZE {
                break;
            }
            after = Some(last);
        }

        info!(
            rule_id = %rule_id,
            records = evaluated,
            scheduled = totals.scheduled,
            skipped = totals.skipped,
            failed = totals.failed,
            "Backfill completed"
        );

        Ok(evaluated)
    }
}

/// Filter rules down to those the event touches.
///
/// A `create_record` with no updated fields sets every field.
fn applicable_rules(rules: Vec<PersistedRule>, event: &RecordEvent) -> Vec<PersistedRule> {
    let all_fields =
        event.event_type == RecordEventType::CreateRecord && event.updated_field_ids.is_empty();
    if all_fields {
        return rules;
    }
    rules
        .into_iter()
        .filter(|r| event.updated_field_ids.contains(&r.field_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RowStatus, TriggerType};

    fn rule(id: &str, field: &str) -> PersistedRule {
        PersistedRule {
            id: id.to_string(),
            destination_id: "dst1".to_string(),
            field_id: field.to_string(),
            trigger_type: TriggerType::Exact,
            offset_minutes: 0,
            name: id.to_string(),
            status: RowStatus::Active,
            deleted_time: None,
        }
    }

    fn event(event_type: RecordEventType, updated: &[&str]) -> RecordEvent {
        RecordEvent {
            table_id: "tbl1".to_string(),
            record_ids: vec!["rec1".to_string()],
            event_type,
            updated_field_ids: updated.iter().map(|s| s.to_string()).collect(),
            destination_id: None,
            rule_id: None,
        }
    }

    #[test]
    fn test_create_without_fields_applies_all_rules() {
        let rules = vec![rule("r1", "fldDue"), rule("r2", "fldStart")];
        let applicable = applicable_rules(rules, &event(RecordEventType::CreateRecord, &[]));
        assert_eq!(applicable.len(), 2);
    }

    #[test]
    fn test_create_with_fields_filters_rules() {
        let rules = vec![rule("r1", "fldDue"), rule("r2", "fldStart")];
        let applicable =
            applicable_rules(rules, &event(RecordEventType::CreateRecord, &["fldStart"]));
        assert_eq!(applicable.len(), 1);
        assert_eq!(applicable[0].id, "r2");
    }

    #[test]
    fn test_update_only_touches_updated_fields() {
        let rules = vec![rule("r1", "fldDue"), rule("r2", "fldStart")];
        let applicable = applicable_rules(rules, &event(RecordEventType::UpdateRecord, &["fldDue"]));
        assert_eq!(applicable.len(), 1);
        assert_eq!(applicable[0].id, "r1");
    }

    #[test]
    fn test_update_without_fields_touches_nothing() {
        let rules = vec![rule("r1", "fldDue")];
        assert!(applicable_rules(rules, &event(RecordEventType::UpdateRecord, &[])).is_empty());
    }
}
