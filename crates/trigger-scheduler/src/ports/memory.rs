// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory port implementation for testing.
//!
//! Holds tables, views, fields and records in process memory so the
//! scheduler and processor can be exercised without the host product.
//! Record field values are keyed by `db_field_name`; timestamps are stored
//! as RFC 3339 strings, mirroring the JSON the host product returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::traits::*;
use crate::model::RowStatus;

#[derive(Debug, Clone)]
struct MemoryTable {
    info: TableInfo,
    views: Vec<String>,
    fields: HashMap<String, FieldInfo>,
    /// BTreeMap keeps record IDs ordered for paging.
    records: BTreeMap<String, serde_json::Map<String, Value>>,
}

/// In-memory catalog implementing all three ports.
#[derive(Default)]
pub struct InMemoryCatalog {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl InMemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with a single default view.
    pub async fn add_table(&self, info: TableInfo, view_id: &str) {
        let mut tables = self.tables.write().await;
        tables.insert(
            info.id.clone(),
            MemoryTable {
                info,
                views: vec![view_id.to_string()],
                fields: HashMap::new(),
                records: BTreeMap::new(),
            },
        );
    }

    /// Drop a table entirely.
    pub async fn remove_table(&self, table_id: &str) {
        self.tables.write().await.remove(table_id);
    }

    /// Delete every view of a table.
    pub async fn clear_views(&self, table_id: &str) {
        if let Some(table) = self.tables.write().await.get_mut(table_id) {
            table.views.clear();
        }
    }

    /// Add or replace a field definition.
    pub async fn add_field(&self, table_id: &str, field: FieldInfo) {
        if let Some(table) = self.tables.write().await.get_mut(table_id) {
            table.fields.insert(field.id.clone(), field);
        }
    }

    /// Remove a field definition.
    pub async fn remove_field(&self, table_id: &str, field_id: &str) {
        if let Some(table) = self.tables.write().await.get_mut(table_id) {
            table.fields.remove(field_id);
        }
    }

    /// Change a field's status.
    pub async fn set_field_status(&self, table_id: &str, field_id: &str, status: RowStatus) {
        if let Some(field) = self
            .tables
            .write()
            .await
            .get_mut(table_id)
            .and_then(|t| t.fields.get_mut(field_id))
        {
            field.status = status;
        }
    }

    /// Insert or replace a record.
    pub async fn put_record(
        &self,
        table_id: &str,
        record_id: &str,
        fields: serde_json::Map<String, Value>,
    ) {
        if let Some(table) = self.tables.write().await.get_mut(table_id) {
            table.records.insert(record_id.to_string(), fields);
        }
    }

    /// Set a timestamp value on an existing record (`None` clears it).
    pub async fn set_timestamp(
        &self,
        table_id: &str,
        record_id: &str,
        db_field_name: &str,
        value: Option<DateTime<Utc>>,
    ) {
        if let Some(record) = self
            .tables
            .write()
            .await
            .get_mut(table_id)
            .and_then(|t| t.records.get_mut(record_id))
        {
            let value = value.map_or(Value::Null, |v| Value::String(v.to_rfc3339()));
            record.insert(db_field_name.to_string(), value);
        }
    }

    /// Remove a record.
    pub async fn delete_record(&self, table_id: &str, record_id: &str) {
        if let Some(table) = self.tables.write().await.get_mut(table_id) {
            table.records.remove(record_id);
        }
    }
}

#[async_trait]
impl RecordReader for InMemoryCatalog {
    async fn get_record(
        &self,
        table_id: &str,
        view_id: &str,
        record_id: &str,
    ) -> Result<Option<RecordSnapshot>> {
        let tables = self.tables.read().await;
        let Some(table) = tables.get(table_id) else {
            return Ok(None);
        };
        if !table.views.iter().any(|v| v == view_id) {
            return Err(PortError::ViewNotFound {
                table_id: table_id.to_string(),
                view_id: view_id.to_string(),
            });
        }
        Ok(table.records.get(record_id).map(|fields| RecordSnapshot {
            id: record_id.to_string(),
            fields: fields.clone(),
        }))
    }

    async fn read_timestamp(
        &self,
        db_table_name: &str,
        record_id: &str,
        db_field_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        let value = tables
            .values()
            .find(|t| t.info.db_table_name == db_table_name)
            .and_then(|t| t.records.get(record_id))
            .and_then(|r| r.get(db_field_name));

        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| PortError::InvalidValue {
                    field: db_field_name.to_string(),
                    reason: e.to_string(),
                }),
            Some(other) => Err(PortError::InvalidValue {
                field: db_field_name.to_string(),
                reason: format!("expected timestamp string, got {}", other),
            }),
        }
    }

    async fn list_record_ids(
        &self,
        db_table_name: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let tables = self.tables.read().await;
        let Some(table) = tables.values().find(|t| t.info.db_table_name == db_table_name) else {
            return Ok(Vec::new());
        };
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(table
            .records
            .keys()
            .filter(|id| after.is_none_or(|a| id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FieldCatalog for InMemoryCatalog {
    async fn get_fields(&self, table_id: &str, field_ids: &[String]) -> Result<Vec<FieldInfo>> {
        let tables = self.tables.read().await;
        let Some(table) = tables.get(table_id) else {
            return Ok(Vec::new());
        };
        Ok(field_ids
            .iter()
            .filter_map(|id| table.fields.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl TableCatalog for InMemoryCatalog {
    async fn get_table(&self, table_id: &str) -> Result<Option<TableInfo>> {
        Ok(self
            .tables
            .read()
            .await
            .get(table_id)
            .map(|t| t.info.clone()))
    }

    async fn default_view_id(&self, table_id: &str) -> Result<Option<String>> {
        Ok(self
            .tables
            .read()
            .await
            .get(table_id)
            .and_then(|t| t.views.first().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn catalog_with_record() -> InMemoryCatalog {
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
        catalog
            .put_record("tbl1", "rec1", serde_json::Map::new())
            .await;
        catalog
    }

    #[tokio::test]
    async fn test_timestamp_round_trip() {
        let catalog = catalog_with_record().await;
        let due = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();

        catalog
            .set_timestamp("tbl1", "rec1", "due_date", Some(due))
            .await;
        let read = catalog
            .read_timestamp("bse1.tasks", "rec1", "due_date")
            .await
            .unwrap();
        assert_eq!(read, Some(due));

        catalog.set_timestamp("tbl1", "rec1", "due_date", None).await;
        let read = catalog
            .read_timestamp("bse1.tasks", "rec1", "due_date")
            .await
            .unwrap();
        assert_eq!(read, None);
    }

    #[tokio::test]
    async fn test_get_record_requires_known_view() {
        let catalog = catalog_with_record().await;
        assert!(catalog.get_record("tbl1", "viw1", "rec1").await.unwrap().is_some());
        assert!(matches!(
            catalog.get_record("tbl1", "viwX", "rec1").await,
            Err(PortError::ViewNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_record_ids_pages() {
        let catalog = catalog_with_record().await;
        for id in ["rec2", "rec3", "rec4"] {
            catalog.put_record("tbl1", id, serde_json::Map::new()).await;
        }

        let first = catalog.list_record_ids("bse1.tasks", None, 2).await.unwrap();
        assert_eq!(first, vec!["rec1", "rec2"]);
        let second = catalog
            .list_record_ids("bse1.tasks", Some("rec2"), 2)
            .await
            .unwrap();
        assert_eq!(second, vec!["rec3", "rec4"]);
    }
}
