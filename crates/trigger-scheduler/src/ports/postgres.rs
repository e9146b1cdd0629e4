// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Postgres adapter for the collaborator ports.
//!
//! Reads the host product's metadata tables directly:
//! - `table_meta (id, base_id, db_table_name, deleted_time)`
//! - `field (id, table_id, type, db_field_name, status, deleted_time)`
//! - `view (id, table_id, "order", deleted_time)`
//!
//! Physical record tables are keyed by `__id` and soft-deleted through
//! `__deleted_time`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::warn;

use super::traits::*;
use crate::model::RowStatus;

/// Port implementation backed by the host product's Postgres schema.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Create a catalog reading through the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Quote a (possibly schema-qualified) identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

#[async_trait]
impl RecordReader for PgCatalog {
    async fn get_record(
        &self,
        table_id: &str,
        view_id: &str,
        record_id: &str,
    ) -> Result<Option<RecordSnapshot>> {
        let view_exists: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM view
            WHERE id = $1 AND table_id = $2 AND deleted_time IS NULL
            "#,
        )
        .bind(view_id)
        .bind(table_id)
        .fetch_optional(&self.pool)
        .await?;

        if view_exists.is_none() {
            return Err(PortError::ViewNotFound {
                table_id: table_id.to_string(),
                view_id: view_id.to_string(),
            });
        }

        let Some(db_table_name) = sqlx::query_scalar::<_, String>(
            "SELECT db_table_name FROM table_meta WHERE id = $1 AND deleted_time IS NULL",
        )
        .bind(table_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let query = format!(
            r#"
            SELECT to_jsonb(t) FROM {} t
            WHERE t.__id = $1 AND t.__deleted_time IS NULL
            "#,
            quote_ident(&db_table_name)
        );

        let row: Option<serde_json::Value> = sqlx::query_scalar(&query)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|value| {
            let fields = match value {
                serde_json::Value::Object(map) => map
                    .into_iter()
                    .filter(|(column, _)| !column.starts_with("__"))
                    .collect(),
                _ => serde_json::Map::new(),
            };
            RecordSnapshot {
                id: record_id.to_string(),
                fields,
            }
        }))
    }

    async fn read_timestamp(
        &self,
        db_table_name: &str,
        record_id: &str,
        db_field_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let query = format!(
            r#"
            SELECT {}::TIMESTAMPTZ FROM {}
            WHERE __id = $1 AND __deleted_time IS NULL
            "#,
            quote_ident(db_field_name),
            quote_ident(db_table_name)
        );

        let value: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(&query)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::ColumnDecode { source, .. } => PortError::InvalidValue {
                    field: db_field_name.to_string(),
                    reason: source.to_string(),
                },
                other => PortError::Database(other),
            })?;

        Ok(value.flatten())
    }

    async fn list_record_ids(
        &self,
        db_table_name: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let query = format!(
            r#"
            SELECT __id FROM {}
            WHERE __deleted_time IS NULL
              AND ($1::TEXT IS NULL OR __id > $1)
            ORDER BY __id ASC
            LIMIT $2
            "#,
            quote_ident(db_table_name)
        );

        Ok(sqlx::query_scalar(&query)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl FieldCatalog for PgCatalog {
    async fn get_fields(&self, table_id: &str, field_ids: &[String]) -> Result<Vec<FieldInfo>> {
        if field_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            r#"
            SELECT id, type, db_field_name, status
            FROM field
            WHERE table_id = $1 AND id = ANY($2) AND deleted_time IS NULL
            "#,
        )
        .bind(table_id)
        .bind(field_ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, field_type, db_field_name, status)| {
                let status = status.parse().unwrap_or_else(|e| {
                    warn!(field_id = %id, error = %e, "Unknown field status, treating as inactive");
                    RowStatus::Inactive
                });
                FieldInfo {
                    id,
                    field_type,
                    db_field_name,
                    status,
                }
            })
            .collect())
    }
}

#[async_trait]
impl TableCatalog for PgCatalog {
    async fn get_table(&self, table_id: &str) -> Result<Option<TableInfo>> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT id, base_id, db_table_name
            FROM table_meta
            WHERE id = $1 AND deleted_time IS NULL
            "#,
        )
        .bind(table_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, base_id, db_table_name)| TableInfo {
            id,
            base_id,
            db_table_name,
        }))
    }

    async fn default_view_id(&self, table_id: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT id FROM view
            WHERE table_id = $1 AND deleted_time IS NULL
            ORDER BY "order" ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(table_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}
