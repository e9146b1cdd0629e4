// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Port trait definitions.
//!
//! The scheduler never owns tables, fields or records. It reads them through
//! three synchronous request/response capabilities implemented by the host
//! product.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::model::RowStatus;

/// Field types whose values are timestamps a rule can be anchored on.
pub const TIMESTAMP_FIELD_TYPES: &[&str] = &["date", "createdTime", "lastModifiedTime"];

/// Errors from port operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PortError {
    /// Backing database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be interpreted.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field (db name) holding the value.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The view supplied as read context does not belong to the table.
    #[error("View {view_id} not found for table {table_id}")]
    ViewNotFound {
        /// Table being read.
        table_id: String,
        /// View that was supplied.
        view_id: String,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for port operations.
pub type Result<T> = std::result::Result<T, PortError>;

/// Field metadata needed to schedule and validate triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field ID.
    pub id: String,
    /// Field type name (e.g. `date`).
    pub field_type: String,
    /// Column name in the physical record table.
    pub db_field_name: String,
    /// Whether the field is usable.
    pub status: RowStatus,
}

impl FieldInfo {
    /// Whether a rule may be anchored on this field.
    pub fn is_timestamp(&self) -> bool {
        TIMESTAMP_FIELD_TYPES.contains(&self.field_type.as_str())
    }

    /// Whether the field is active.
    pub fn is_active(&self) -> bool {
        self.status == RowStatus::Active
    }
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    /// Table ID.
    pub id: String,
    /// Base (workspace) the table belongs to.
    pub base_id: String,
    /// Physical storage name of the table's row store.
    pub db_table_name: String,
}

/// Snapshot of an active record, delivered verbatim in webhook payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSnapshot {
    /// Record ID.
    pub id: String,
    /// Field values keyed by field name.
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Reads records from the host product's row store.
#[async_trait]
pub trait RecordReader: Send + Sync {
    /// Return the active record, or `None` when it is deleted or inactive.
    ///
    /// Reads always happen in the context of a view of the table.
    async fn get_record(
        &self,
        table_id: &str,
        view_id: &str,
        record_id: &str,
    ) -> Result<Option<RecordSnapshot>>;

    /// Read one timestamp column off the physical record row.
    ///
    /// Returns `None` when the record is missing or the value is null.
    async fn read_timestamp(
        &self,
        db_table_name: &str,
        record_id: &str,
        db_field_name: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    /// List active record IDs in ascending order, starting after `after`.
    async fn list_record_ids(
        &self,
        db_table_name: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>>;
}

/// Resolves field metadata.
#[async_trait]
pub trait FieldCatalog: Send + Sync {
    /// Return metadata for the requested fields that still exist in the table.
    ///
    /// Deleted or unknown field IDs are omitted from the result.
    async fn get_fields(&self, table_id: &str, field_ids: &[String]) -> Result<Vec<FieldInfo>>;
}

/// Resolves table metadata.
#[async_trait]
pub trait TableCatalog: Send + Sync {
    /// Return the table, or `None` when it no longer exists.
    async fn get_table(&self, table_id: &str) -> Result<Option<TableInfo>>;

    /// Return the first non-deleted view of the table.
    async fn default_view_id(&self, table_id: &str) -> Result<Option<String>>;
}

/// The three collaborator ports, bundled for injection.
#[derive(Clone)]
pub struct Ports {
    /// Record reads.
    pub records: Arc<dyn RecordReader>,
    /// Field metadata.
    pub fields: Arc<dyn FieldCatalog>,
    /// Table metadata.
    pub tables: Arc<dyn TableCatalog>,
}

impl Ports {
    /// Bundle ports from a single implementation of all three traits.
    pub fn from_catalog<C>(catalog: Arc<C>) -> Self
    where
        C: RecordReader + FieldCatalog + TableCatalog + 'static,
    {
        Self {
            records: catalog.clone(),
            fields: catalog.clone(),
            tables: catalog,
        }
    }

    /// Fetch a single field, `None` when it has been deleted.
    pub async fn get_field(&self, table_id: &str, field_id: &str) -> Result<Option<FieldInfo>> {
        let fields = self
            .fields
            .get_fields(table_id, &[field_id.to_string()])
            .await?;
        Ok(fields.into_iter().find(|f| f.id == field_id))
    }
}
