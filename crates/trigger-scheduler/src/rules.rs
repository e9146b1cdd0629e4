// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger rule validation and reconciliation.
//!
//! A destination's rules are edited as a whole: the configuration surface
//! submits the full rule array and [`RuleReconciler::sync_destination_rules`]
//! turns it into creates, updates and deletes against `trigger_schedules`.
//!
//! Side effects of applying a change set:
//! - create: insert an active rule, then backfill existing records
//! - update: overwrite the rule, cancel its idle instances, then backfill
//! - delete: soft-delete the rule and cancel its idle instances
//!
//! Instances already PROCESSING are never touched here; the fire-time
//! validator catches anything that changed underneath them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info};

use crate::db;
use crate::error::{Error as SchedulerError, Result};
use crate::model::{CancelReason, DeliveryStrategy, PersistedRule, TriggerRule, TriggerType};
use crate::ports::FieldCatalog;
use crate::scheduler::ScheduleComputer;

/// A submitted rule was rejected before reaching the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleValidationError {
    /// Rule name is blank.
    #[error("Rule at position {index} has an empty name")]
    EmptyName {
        /// Position in the submitted array.
        index: usize,
    },

    /// BEFORE/AFTER rule without a positive offset.
    #[error("Rule '{name}' ({trigger_type}) requires a positive offset, got {offset_minutes}")]
    NonPositiveOffset {
        /// Rule name.
        name: String,
        /// Rule type.
        trigger_type: TriggerType,
        /// Submitted offset.
        offset_minutes: i32,
    },

    /// The field does not exist in the destination's table.
    #[error("Field {field_id} not found")]
    FieldNotFound {
        /// Submitted field ID.
        field_id: String,
    },

    /// The field exists but does not hold timestamps.
    #[error("Field {field_id} has type '{field_type}', which is not a timestamp type")]
    NonTimestampField {
        /// Submitted field ID.
        field_id: String,
        /// Actual field type.
        field_type: String,
    },

    /// Two rules share field, type and offset.
    #[error("Duplicate rule for field {field_id}: {trigger_type} {offset_minutes} minutes")]
    DuplicateRule {
        /// Field ID.
        field_id: String,
        /// Rule type.
        trigger_type: TriggerType,
        /// Effective offset.
        offset_minutes: i32,
    },
}

/// Offset that takes part in fire-time computation (EXACT ignores it).
fn effective_offset(rule: &TriggerRule) -> i32 {
    if rule.trigger_type.uses_offset() {
        rule.offset_minutes
    } else {
        0
    }
}

/// Checks that need no field metadata: names, offsets and duplicates.
pub fn check_rule_shapes(rules: &[TriggerRule]) -> std::result::Result<(), RuleValidationError> {
    let mut seen = HashSet::new();

    for (index, rule) in rules.iter().enumerate() {
        if rule.name.trim().is_empty() {
            return Err(RuleValidationError::EmptyName { index });
        }

        if rule.trigger_type.uses_offset() && rule.offset_minutes <= 0 {
            return Err(RuleValidationError::NonPositiveOffset {
                name: rule.name.clone(),
                trigger_type: rule.trigger_type,
                offset_minutes: rule.offset_minutes,
            });
        }

        let key = (rule.field_id.as_str(), rule.trigger_type, effective_offset(rule));
        if !seen.insert(key) {
            return Err(RuleValidationError::DuplicateRule {
                field_id: rule.field_id.clone(),
                trigger_type: rule.trigger_type,
                offset_minutes: effective_offset(rule),
            });
        }
    }

    Ok(())
}

/// Validate a submitted rule array against the destination's table.
pub async fn validate_rules(
    fields: &dyn FieldCatalog,
    table_id: &str,
    rules: &[TriggerRule],
) -> Result<()> {
    check_rule_shapes(rules)?;

    let field_ids: Vec<String> = rules
        .iter()
        .map(|r| r.field_id.clone())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let found: HashMap<String, _> = fields
        .get_fields(table_id, &field_ids)
        .await?
        .into_iter()
        .map(|f| (f.id.clone(), f))
        .collect();

    for rule in rules {
        let field = found
            .get(&rule.field_id)
            .ok_or_else(|| RuleValidationError::FieldNotFound {
                field_id: rule.field_id.clone(),
            })?;
        if !field.is_timestamp() {
            return Err(RuleValidationError::NonTimestampField {
                field_id: rule.field_id.clone(),
                field_type: field.field_type.clone(),
            }
            .into());
        }
    }

    Ok(())
}

/// Outcome of diffing persisted rules against a submitted array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleChanges {
    /// Rules to insert.
    pub to_create: Vec<TriggerRule>,
    /// Existing rule ID paired with its new attributes.
    pub to_update: Vec<(String, TriggerRule)>,
    /// Existing rules absent from the submission.
    pub to_delete: Vec<PersistedRule>,
}

impl RuleChanges {
    /// Whether applying the changes would do nothing.
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Diff persisted rules against a submitted rule array.
///
/// Items without an ID are created. Items whose ID matches an existing rule
/// are updated only if an editable attribute differs. Existing rules whose ID
/// is absent from the submission are deleted. An ID that matches no existing
/// rule is treated as a new rule.
pub fn reconcile_rules(existing: &[PersistedRule], incoming: &[TriggerRule]) -> RuleChanges {
    let by_id: HashMap<&str, &PersistedRule> =
        existing.iter().map(|r| (r.id.as_str(), r)).collect();
    let incoming_ids: HashSet<&str> = incoming.iter().filter_map(|r| r.id.as_deref()).collect();

    let mut changes = RuleChanges::default();

    for rule in incoming {
        match rule.id.as_deref().and_then(|id| by_id.get(id)) {
            Some(current) => {
                if current.differs_from(rule) {
                    changes.to_update.push((current.id.clone(), rule.clone()));
                }
            }
            None => changes.to_create.push(TriggerRule {
                id: None,
                ..rule.clone()
            }),
        }
    }

    changes.to_delete = existing
        .iter()
        .filter(|r| !incoming_ids.contains(r.id.as_str()))
        .cloned()
        .collect();

    changes
}

/// Rule IDs touched by an applied change set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedRuleChanges {
    /// Newly inserted rule IDs.
    pub created: Vec<String>,
    /// Updated rule IDs.
    pub updated: Vec<String>,
    /// Soft-deleted rule IDs.
    pub deleted: Vec<String>,
    /// Instances cancelled by updates and deletes.
    pub cancelled_instances: u64,
}

impl AppliedRuleChanges {
    /// Rules whose existing records need re-evaluation.
    pub fn backfill_rule_ids(&self) -> impl Iterator<Item = &String> {
        self.created.iter().chain(self.updated.iter())
    }
}

/// Applies rule change sets and drives the follow-up backfill.
#[derive(Clone)]
pub struct RuleReconciler {
    pool: PgPool,
    fields: Arc<dyn FieldCatalog>,
    scheduler: ScheduleComputer,
}

impl RuleReconciler {
    /// Create a reconciler.
    pub fn new(pool: PgPool, fields: Arc<dyn FieldCatalog>, scheduler: ScheduleComputer) -> Self {
        Self {
            pool,
            fields,
            scheduler,
        }
    }

    /// Validate, reconcile, apply and backfill a destination's rule array.
    pub async fn sync_destination_rules(
        &self,
        destination_id: &str,
        incoming: &[TriggerRule],
    ) -> Result<AppliedRuleChanges> {
        let destination = db::get_destination(&self.pool, destination_id)
            .await?
            .ok_or_else(|| SchedulerError::DestinationNotFound(destination_id.to_string()))?;

        validate_rules(self.fields.as_ref(), &destination.table_id, incoming).await?;

        let existing = db::list_rules(&self.pool, destination_id).await?;
        let changes = reconcile_rules(&existing, incoming);
        if changes.is_empty() {
            debug!(destination_id = %destination_id, "Trigger rules unchanged");
            return Ok(AppliedRuleChanges::default());
        }

        let applied = self.apply(destination_id, &changes).await?;

        for rule_id in applied.backfill_rule_ids() {
            let evaluated = self.scheduler.backfill_rule(rule_id).await?;
            debug!(rule_id = %rule_id, records = evaluated, "Backfilled rule");
        }

        Ok(applied)
    }

    /// Persist a change set in one transaction.
    ///
    /// Does not backfill; callers run [`ScheduleComputer::backfill_rule`] for
    /// [`AppliedRuleChanges::backfill_rule_ids`] after this returns.
    pub async fn apply(
        &self,
        destination_id: &str,
        changes: &RuleChanges,
    ) -> Result<AppliedRuleChanges> {
        let mut tx = self.pool.begin().await?;
        let mut applied = AppliedRuleChanges::default();

        for rule in &changes.to_create {
            let created = db::insert_rule(&mut *tx, destination_id, rule).await?;
            applied.created.push(created.id);
        }

        for (rule_id, rule) in &changes.to_update {
            if !db::update_rule(&mut *tx, rule_id, rule).await? {
                return Err(SchedulerError::RuleNotFound(rule_id.clone()));
            }
            applied.cancelled_instances +=
                db::cancel_idle_for_rule(&mut *tx, rule_id, CancelReason::RuleUpdated).await?;
            applied.updated.push(rule_id.clone());
        }

        for rule in &changes.to_delete {
            if db::soft_delete_rule(&mut *tx, &rule.id).await? {
                applied.cancelled_instances +=
                    db::cancel_idle_for_rule(&mut *tx, &rule.id, CancelReason::RuleDeleted)
                        .await?;
                applied.deleted.push(rule.id.clone());
            }
        }

        let destination = db::get_destination(&mut *tx, destination_id).await?;
        if destination.is_some_and(|d| d.strategy == DeliveryStrategy::TimeBased) {
            let active = db::count_active_rules(&mut *tx, destination_id).await?;
            db::set_destination_streaming(&mut *tx, destination_id, active > 0).await?;
        }

        tx.commit().await?;

        info!(
            destination_id = %destination_id,
            created = applied.created.len(),
            updated = applied.updated.len(),
            deleted = applied.deleted.len(),
            cancelled_instances = applied.cancelled_instances,
            "Applied trigger rule changes"
        );

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RowStatus;
    use crate::ports::{FieldInfo, InMemoryCatalog, TableInfo};

    fn rule(id: Option<&str>, trigger_type: TriggerType, offset: i32, field: &str) -> TriggerRule {
        TriggerRule {
            id: id.map(str::to_string),
            trigger_type,
            offset_minutes: offset,
            field_id: field.to_string(),
            name: format!("{} {}", trigger_type, offset),
        }
    }

    fn persisted(id: &str, trigger_type: TriggerType, offset: i32, field: &str) -> PersistedRule {
        PersistedRule {
            id: id.to_string(),
            destination_id: "dst1".to_string(),
            field_id: field.to_string(),
            trigger_type,
            offset_minutes: offset,
            name: format!("{} {}", trigger_type, offset),
            status: RowStatus::Active,
            deleted_time: None,
        }
    }

    #[test]
    fn test_reconcile_create_update_delete() {
        let existing = vec![
            persisted("r1", TriggerType::Before, 30, "fldDue"),
            persisted("r2", TriggerType::After, 60, "fldDue"),
            persisted("r3", TriggerType::Exact, 0, "fldStart"),
        ];
        let incoming = vec![
            // unchanged
            rule(Some("r1"), TriggerType::Before, 30, "fldDue"),
            // offset changed
            TriggerRule {
                offset_minutes: 90,
                ..rule(Some("r2"), TriggerType::After, 60, "fldDue")
            },
            // new
            rule(None, TriggerType::Exact, 0, "fldDue"),
        ];

        let changes = reconcile_rules(&existing, &incoming);

        assert_eq!(changes.to_create.len(), 1);
        assert_eq!(changes.to_create[0].trigger_type, TriggerType::Exact);
        assert_eq!(changes.to_update.len(), 1);
        assert_eq!(changes.to_update[0].0, "r2");
        assert_eq!(changes.to_update[0].1.offset_minutes, 90);
        assert_eq!(changes.to_delete.len(), 1);
        assert_eq!(changes.to_delete[0].id, "r3");
    }

    #[test]
    fn test_reconcile_unchanged_is_empty() {
        let existing = vec![persisted("r1", TriggerType::Before, 30, "fldDue")];
        let incoming = vec![rule(Some("r1"), TriggerType::Before, 30, "fldDue")];
        assert!(reconcile_rules(&existing, &incoming).is_empty());
    }

    #[test]
    fn test_reconcile_unknown_id_is_created() {
        let incoming = vec![rule(Some("ghost"), TriggerType::After, 5, "fldDue")];
        let changes = reconcile_rules(&[], &incoming);
        assert_eq!(changes.to_create.len(), 1);
        assert_eq!(changes.to_create[0].id, None);
    }

    #[test]
    fn test_reconcile_empty_submission_deletes_all() {
        let existing = vec![
            persisted("r1", TriggerType::Before, 30, "fldDue"),
            persisted("r2", TriggerType::After, 60, "fldDue"),
        ];
        let changes = reconcile_rules(&existing, &[]);
        assert_eq!(changes.to_delete.len(), 2);
        assert!(changes.to_create.is_empty());
    }

    #[test]
    fn test_offset_must_be_positive_for_before_and_after() {
        let err = check_rule_shapes(&[rule(None, TriggerType::Before, 0, "fldDue")]).unwrap_err();
        assert!(matches!(err, RuleValidationError::NonPositiveOffset { .. }));

        let err = check_rule_shapes(&[rule(None, TriggerType::After, -5, "fldDue")]).unwrap_err();
        assert!(matches!(err, RuleValidationError::NonPositiveOffset { .. }));

        assert!(check_rule_shapes(&[rule(None, TriggerType::Exact, 0, "fldDue")]).is_ok());
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let err = check_rule_shapes(&[
            rule(None, TriggerType::Before, 30, "fldDue"),
            TriggerRule {
                name: "Other name".to_string(),
                ..rule(None, TriggerType::Before, 30, "fldDue")
            },
        ])
        .unwrap_err();
        assert!(matches!(err, RuleValidationError::DuplicateRule { .. }));

        // Same offset on a different field is fine.
        assert!(check_rule_shapes(&[
            rule(None, TriggerType::Before, 30, "fldDue"),
            rule(None, TriggerType::Before, 30, "fldStart"),
        ])
        .is_ok());
    }

    #[test]
    fn test_exact_offsets_collapse_for_duplicates() {
        let err = check_rule_shapes(&[
            rule(None, TriggerType::Exact, 0, "fldDue"),
            rule(None, TriggerType::Exact, 15, "fldDue"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            RuleValidationError::DuplicateRule {
                field_id: "fldDue".to_string(),
                trigger_type: TriggerType::Exact,
                offset_minutes: 0,
            }
        );
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut r = rule(None, TriggerType::Exact, 0, "fldDue");
        r.name = "  ".to_string();
        assert_eq!(
            check_rule_shapes(&[r]).unwrap_err(),
            RuleValidationError::EmptyName { index: 0 }
        );
    }

    async fn catalog() -> InMemoryCatalog {
        let catalog = InMemoryCatalog::new();
        catalog
            .add_table(
                TableInfo {
                    id: "tbl1".to_string(),
                    base_id: "bse1".to_string(),
                    db_table_name: "bse1.tasks".to_string(),
                },
                "viw1",
            )
            .await;
        for (id, field_type) in [("fldDue", "date"), ("fldTitle", "singleLineText")] {
            catalog
                .add_field(
                    "tbl1",
                    FieldInfo {
                        id: id.to_string(),
                        field_type: field_type.to_string(),
                        db_field_name: id.to_lowercase(),
                        status: RowStatus::Active,
                    },
                )
                .await;
        }
        catalog
    }

    #[tokio::test]
    async fn test_validate_rules_against_fields() {
        let catalog = catalog().await;

        validate_rules(&catalog, "tbl1", &[rule(None, TriggerType::Exact, 0, "fldDue")])
            .await
            .unwrap();

        let err = validate_rules(&catalog, "tbl1", &[rule(None, TriggerType::Exact, 0, "fldTitle")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::RuleValidation(RuleValidationError::NonTimestampField { .. })
        ));

        let err = validate_rules(&catalog, "tbl1", &[rule(None, TriggerType::Exact, 0, "fldGone")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::RuleValidation(RuleValidationError::FieldNotFound { .. })
        ));
    }
}
