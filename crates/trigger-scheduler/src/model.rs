// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain types shared by the reconciler, schedule computer and processor.
//!
//! Enum-valued columns are stored as TEXT; every enum here round-trips through
//! its canonical database spelling via [`std::str::FromStr`] and `as_str()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A TEXT column held a value that is not a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown {kind} value: {value:?}")]
pub struct ParseEnumError {
    /// Enum being parsed.
    pub kind: &'static str,
    /// Rejected input.
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Canonical database spelling.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseEnumError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

/// When a rule fires relative to the record's timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerType {
    /// `offset_minutes` before the timestamp.
    Before,
    /// At the timestamp; offset is ignored.
    Exact,
    /// `offset_minutes` after the timestamp.
    After,
}

text_enum!(TriggerType, "trigger type", {
    Before => "BEFORE",
    Exact => "EXACT",
    After => "AFTER",
});

impl TriggerType {
    /// Whether the rule's offset participates in fire-time computation.
    pub fn uses_offset(&self) -> bool {
        !matches!(self, Self::Exact)
    }
}

/// How a destination is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStrategy {
    /// Fired directly by record mutations (not handled here).
    EventBased,
    /// Fired by persisted time-based rules.
    TimeBased,
}

text_enum!(DeliveryStrategy, "delivery strategy", {
    EventBased => "EVENT_BASED",
    TimeBased => "TIME_BASED",
});

/// Lifecycle state of a scheduled instance.
///
/// ```text
/// PENDING ──claim──▶ PROCESSING ──┬──▶ FIRED
///                        ▲        ├──▶ CANCELLED
///                        │        └──▶ FAILED ──(retries left)──┐
///                        └──────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerState {
    /// Waiting for `scheduled_time`.
    Pending,
    /// Claimed by a processor.
    Processing,
    /// Webhook delivered.
    Fired,
    /// Delivery failed; retried while `retry_count < max_retries`.
    Failed,
    /// Invalidated before or at fire time.
    Cancelled,
}

text_enum!(TriggerState, "trigger state", {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Fired => "FIRED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

/// Row liveness flag used for rules and instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    /// Live row.
    Active,
    /// Retired row (terminal or superseded).
    Inactive,
}

text_enum!(RowStatus, "row status", {
    Active => "active",
    Inactive => "inactive",
});

/// Why an instance was cancelled outside the fire-time validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer computation replaced this instance.
    Superseded,
    /// The record was deleted.
    RecordDeleted,
    /// The owning rule was edited.
    RuleUpdated,
    /// The owning rule was deleted.
    RuleDeleted,
}

text_enum!(CancelReason, "cancel reason", {
    Superseded => "SUPERSEDED",
    RecordDeleted => "RECORD_DELETED",
    RuleUpdated => "RULE_UPDATED",
    RuleDeleted => "RULE_DELETED",
});

/// A destination: webhook endpoint plus trigger strategy for one table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Destination {
    /// Destination ID.
    pub id: String,
    /// Table whose records feed this destination.
    pub table_id: String,
    /// Display name.
    pub name: String,
    /// Target URL for webhook delivery.
    pub webhook_url: String,
    /// Trigger strategy.
    #[sqlx(try_from = "String")]
    pub strategy: DeliveryStrategy,
    /// Whether the destination is currently streaming.
    pub is_streaming: bool,
    /// Optional HMAC secret used to sign deliveries.
    pub signing_secret: Option<String>,
    /// Soft-delete marker.
    pub deleted_time: Option<DateTime<Utc>>,
}

/// A trigger rule as submitted by the configuration surface.
///
/// `id` is present for rules that already exist and absent for new ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRule {
    /// Existing rule ID, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Fire relative to the timestamp.
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Offset in minutes (ignored for EXACT).
    #[serde(default)]
    pub offset_minutes: i32,
    /// Timestamp field the rule watches.
    pub field_id: String,
    /// Display name.
    pub name: String,
}

/// A persisted time-based rule owned by a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRule {
    /// Rule ID.
    pub id: String,
    /// Owning destination.
    pub destination_id: String,
    /// Timestamp field the rule watches.
    pub field_id: String,
    /// Fire relative to the timestamp.
    #[sqlx(try_from = "String")]
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    /// Offset in minutes.
    pub offset_minutes: i32,
    /// Display name.
    pub name: String,
    /// Liveness flag.
    #[sqlx(try_from = "String")]
    pub status: RowStatus,
    /// Soft-delete marker.
    #[serde(skip)]
    pub deleted_time: Option<DateTime<Utc>>,
}

impl PersistedRule {
    /// Whether the incoming rule differs in any user-editable attribute.
    pub fn differs_from(&self, rule: &TriggerRule) -> bool {
        self.field_id != rule.field_id
            || self.trigger_type != rule.trigger_type
            || self.offset_minutes != rule.offset_minutes
            || self.name != rule.name
    }
}

/// One concrete future firing for one record under one rule.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduledTrigger {
    /// Instance ID.
    pub id: String,
    /// Destination receiving the webhook.
    pub destination_id: String,
    /// Rule that produced this instance.
    pub rule_id: String,
    /// Record the instance fires for.
    pub record_id: String,
    /// Table the record lives in.
    pub table_id: String,
    /// Field the fire time was derived from.
    pub original_field_id: String,
    /// When the instance becomes due.
    pub scheduled_time: DateTime<Utc>,
    /// Field value at scheduling time (used to detect drift).
    pub original_time: DateTime<Utc>,
    /// Delivery attempts that have failed so far.
    pub retry_count: i32,
    /// Attempts allowed before terminal failure.
    pub max_retries: i32,
    /// When a failed instance becomes eligible again.
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Last failure or cancellation reason.
    pub last_error: Option<String>,
    /// Lifecycle state.
    #[sqlx(try_from = "String")]
    pub state: TriggerState,
    /// Liveness flag.
    #[sqlx(try_from = "String")]
    pub status: RowStatus,
    /// Soft-delete marker.
    pub deleted_time: Option<DateTime<Utc>>,
    /// Last transition time.
    pub last_modified_time: DateTime<Utc>,
}

impl ScheduledTrigger {
    /// Whether this attempt follows at least one failed delivery.
    pub fn is_retry(&self) -> bool {
        self.retry_count > 0
    }
}

/// Kind of record mutation feeding the schedule computer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordEventType {
    /// A record was created.
    CreateRecord,
    /// One or more fields of a record changed.
    UpdateRecord,
    /// A record was deleted.
    DeleteRecord,
}

/// A record mutation, optionally scoped to one destination/rule for backfill.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEvent {
    /// Table the records belong to.
    pub table_id: String,
    /// Affected records.
    pub record_ids: Vec<String>,
    /// Mutation kind.
    pub event_type: RecordEventType,
    /// Fields touched by the mutation.
    #[serde(default)]
    pub updated_field_ids: Vec<String>,
    /// Restrict evaluation to this destination.
    #[serde(default)]
    pub destination_id: Option<String>,
    /// Restrict evaluation to this rule.
    #[serde(default)]
    pub rule_id: Option<String>,
}
