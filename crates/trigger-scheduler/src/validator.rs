// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fire-time validation.
//!
//! A claimed instance is re-checked against the current state of the world
//! before its webhook goes out. Checks run in a fixed order and stop at the
//! first failure; the failure's reason code ends up in `last_error` of the
//! cancelled instance.

use thiserror::Error;

use crate::model::{Destination, ScheduledTrigger};
use crate::ports::{Ports, RecordSnapshot, TableInfo};
use crate::timing::timestamps_match;

/// Why a due instance must not fire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidReason {
    /// Destination was deleted.
    #[error("DATA_STREAM_DELETED")]
    DataStreamDeleted,
    /// Table has no view to read the record through.
    #[error("NO_VIEWS_FOUND")]
    NoViewsFound,
    /// Record is gone or inactive.
    #[error("RECORD_DELETED_OR_INACTIVE")]
    RecordDeletedOrInactive,
    /// Field was deleted.
    #[error("FIELD_DELETED")]
    FieldDeleted,
    /// Field exists but is inactive.
    #[error("FIELD_INACTIVE")]
    FieldInactive,
    /// Timestamp is now null.
    #[error("TIMESTAMP_NULL")]
    TimestampNull,
    /// Timestamp moved since the instance was scheduled.
    #[error("TIMESTAMP_CHANGED")]
    TimestampChanged,
    /// A check failed unexpectedly.
    #[error("VALIDATION_ERROR:{0}")]
    ValidationError(String),
}

/// Everything the webhook payload needs, gathered while validating.
#[derive(Debug, Clone)]
pub struct ValidatedTrigger {
    /// Destination to deliver to.
    pub destination: Destination,
    /// Table the record lives in.
    pub table: TableInfo,
    /// Current record snapshot.
    pub record: RecordSnapshot,
}

/// Re-checks claimed instances through the collaborator ports.
#[derive(Clone)]
pub struct TriggerValidator {
    ports: Ports,
}

impl TriggerValidator {
    /// Create a validator.
    pub fn new(ports: Ports) -> Self {
        Self { ports }
    }

    /// Validate a claimed instance.
    ///
    /// `destination` is the instance's destination as read inside the
    /// processing transaction (`None` when deleted). Unexpected port errors
    /// are reported as [`InvalidReason::ValidationError`].
    pub async fn validate(
        &self,
        trigger: &ScheduledTrigger,
        destination: Option<Destination>,
    ) -> Result<ValidatedTrigger, InvalidReason> {
        match self.check(trigger, destination).await {
            Ok(result) => result,
            Err(e) => Err(InvalidReason::ValidationError(e.to_string())),
        }
    }

    async fn check(
        &self,
        trigger: &ScheduledTrigger,
        destination: Option<Destination>,
    ) -> crate::ports::Result<Result<ValidatedTrigger, InvalidReason>> {
        let Some(destination) = destination.filter(|d| d.deleted_time.is_none()) else {
            return Ok(Err(InvalidReason::DataStreamDeleted));
        };

        let Some(view_id) = self.ports.tables.default_view_id(&trigger.table_id).await? else {
            return Ok(Err(InvalidReason::NoViewsFound));
        };

        let Some(table) = self.ports.tables.get_table(&trigger.table_id).await? else {
            return Ok(Err(InvalidReason::RecordDeletedOrInactive));
        };
        let Some(record) = self
            .ports
            .records
            .get_record(&trigger.table_id, &view_id, &trigger.record_id)
            .await?
        else {
            return Ok(Err(InvalidReason::RecordDeletedOrInactive));
        };

        let Some(field) = self
            .ports
            .get_field(&trigger.table_id, &trigger.original_field_id)
            .await?
        else {
            return Ok(Err(InvalidReason::FieldDeleted));
        };
        if !field.is_active() {
            return Ok(Err(InvalidReason::FieldInactive));
        }

        let Some(current) = self
            .ports
            .records
            .read_timestamp(&table.db_table_name, &trigger.record_id, &field.db_field_name)
            .await?
        else {
            return Ok(Err(InvalidReason::TimestampNull));
        };
        if !timestamps_match(trigger.original_time, current) {
            return Ok(Err(InvalidReason::TimestampChanged));
        }

        Ok(Ok(ValidatedTrigger {
            destination,
            table,
            record,
        }))
    }
}
