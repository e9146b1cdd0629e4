// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the Postgres-backed ports against a minimal host schema.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use sqlx::PgPool;
use tokio::sync::OnceCell;
use uuid::Uuid;

use trigger_scheduler::model::{RecordEvent, RecordEventType, RowStatus, TriggerRule, TriggerType};
use trigger_scheduler::ports::{
    FieldCatalog, PgCatalog, PortError, Ports, RecordReader, TableCatalog, postgres::quote_ident,
};
use trigger_scheduler::{ScheduleComputer, db};

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_TRIGGER_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_TRIGGER_DATABASE_URL not set");
            return;
        }
    };
}

static SCHEMA: OnceCell<()> = OnceCell::const_new();

struct CatalogFixture {
    pool: PgPool,
    catalog: PgCatalog,
    table_id: String,
    db_table_name: String,
}

impl CatalogFixture {
    async fn new() -> Self {
        let pool = common::get_test_pool().await.expect("test database");
        SCHEMA
            .get_or_init(|| async {
                sqlx::raw_sql(include_str!("fixtures/catalog_schema.sql"))
                    .execute(&pool)
                    .await
                    .expect("Failed to create catalog schema");
            })
            .await;

        let suffix = Uuid::new_v4().simple().to_string();
        let table_id = format!("tbl{}", suffix);
        let db_table_name = format!("bseCatalog.tasks_{}", suffix);

        sqlx::raw_sql(&format!(
            r#"
            CREATE TABLE {} (
                __id TEXT PRIMARY KEY,
                __deleted_time TIMESTAMPTZ,
                title TEXT,
                due_date TIMESTAMPTZ
            )
            "#,
            quote_ident(&db_table_name)
        ))
        .execute(&pool)
        .await
        .expect("Failed to create record table");

        sqlx::query("INSERT INTO table_meta (id, base_id, db_table_name) VALUES ($1, 'bseCatalog', $2)")
            .bind(&table_id)
            .bind(&db_table_name)
            .execute(&pool)
            .await
            .unwrap();

        for (id, field_type, column, status, deleted) in [
            ("fldDue", "date", "due_date", "active", false),
            ("fldTitle", "singleLineText", "title", "active", false),
            ("fldOff", "date", "due_date", "inactive", false),
            ("fldGone", "date", "due_date", "active", true),
        ] {
            sqlx::query(
                r#"
                INSERT INTO field (id, table_id, type, db_field_name, status, deleted_time)
                VALUES ($1, $2, $3, $4, $5, CASE WHEN $6 THEN NOW() END)
                "#,
            )
            .bind(id)
            .bind(&table_id)
            .bind(field_type)
            .bind(column)
            .bind(status)
            .bind(deleted)
            .execute(&pool)
            .await
            .unwrap();
        }

        for (view, order) in [("B", 2.0_f64), ("A", 1.0)] {
            sqlx::query(r#"INSERT INTO view (id, table_id, "order") VALUES ($1, $2, $3)"#)
                .bind(format!("viw{}{}", view, suffix))
                .bind(&table_id)
                .bind(order)
                .execute(&pool)
                .await
                .unwrap();
        }

        Self {
            catalog: PgCatalog::new(pool.clone()),
            pool,
            table_id,
            db_table_name,
        }
    }

    fn view_id(&self, view: &str) -> String {
        format!("viw{}{}", view, self.table_id.trim_start_matches("tbl"))
    }

    async fn insert_record(&self, id: &str, title: &str, due: Option<DateTime<Utc>>) {
        sqlx::query(&format!(
            "INSERT INTO {} (__id, title, due_date) VALUES ($1, $2, $3)",
            quote_ident(&self.db_table_name)
        ))
        .bind(id)
        .bind(title)
        .bind(due)
        .execute(&self.pool)
        .await
        .unwrap();
    }

    async fn soft_delete_record(&self, id: &str) {
        sqlx::query(&format!(
            "UPDATE {} SET __deleted_time = NOW() WHERE __id = $1",
            quote_ident(&self.db_table_name)
        ))
        .bind(id)
        .execute(&self.pool)
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_table_and_default_view() {
    skip_if_no_db!();
    let fx = CatalogFixture::new().await;

    let table = fx.catalog.get_table(&fx.table_id).await.unwrap().unwrap();
    assert_eq!(table.base_id, "bseCatalog");
    assert_eq!(table.db_table_name, fx.db_table_name);

    let view = fx.catalog.default_view_id(&fx.table_id).await.unwrap();
    assert_eq!(view, Some(fx.view_id("A")));

    assert!(fx.catalog.get_table("tblMissing").await.unwrap().is_none());
    assert!(fx.catalog.default_view_id("tblMissing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_fields_skips_deleted() {
    skip_if_no_db!();
    let fx = CatalogFixture::new().await;

    let ids: Vec<String> = ["fldDue", "fldOff", "fldGone", "fldNope"]
        .into_iter()
        .map(String::from)
        .collect();
    let mut fields = fx.catalog.get_fields(&fx.table_id, &ids).await.unwrap();
    fields.sort_by(|a, b| a.id.cmp(&b.id));

    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].id, "fldDue");
    assert_eq!(fields[0].status, RowStatus::Active);
    assert_eq!(fields[0].db_field_name, "due_date");
    assert_eq!(fields[1].id, "fldOff");
    assert_eq!(fields[1].status, RowStatus::Inactive);

    assert!(fx.catalog.get_fields(&fx.table_id, &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_record_strips_system_columns() {
    skip_if_no_db!();
    let fx = CatalogFixture::new().await;
    fx.insert_record("rec1", "Pay invoice", None).await;
    fx.insert_record("rec2", "Archived", None).await;
    fx.soft_delete_record("rec2").await;

    let record = fx
        .catalog
        .get_record(&fx.table_id, &fx.view_id("A"), "rec1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.id, "rec1");
    assert_eq!(record.fields["title"], "Pay invoice");
    assert!(record.fields.keys().all(|k| !k.starts_with("__")));

    assert!(fx
        .catalog
        .get_record(&fx.table_id, &fx.view_id("A"), "rec2")
        .await
        .unwrap()
        .is_none());
    assert!(fx
        .catalog
        .get_record(&fx.table_id, &fx.view_id("A"), "recMissing")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_get_record_requires_view() {
    skip_if_no_db!();
    let fx = CatalogFixture::new().await;
    fx.insert_record("rec1", "Pay invoice", None).await;

    let err = fx
        .catalog
        .get_record(&fx.table_id, "viwMissing", "rec1")
        .await
        .unwrap_err();
    assert!(matches!(err, PortError::ViewNotFound { .. }));
}

#[tokio::test]
async fn test_read_timestamp() {
    skip_if_no_db!();
    let fx = CatalogFixture::new().await;
    let due = Utc::now().trunc_subsecs(6);
    fx.insert_record("rec1", "With date", Some(due)).await;
    fx.insert_record("rec2", "No date", None).await;

    let read = |id: &'static str| {
        let catalog = fx.catalog.clone();
        let table = fx.db_table_name.clone();
        async move { catalog.read_timestamp(&table, id, "due_date").await.unwrap() }
    };

    assert_eq!(read("rec1").await, Some(due));
    assert_eq!(read("rec2").await, None);
    assert_eq!(read("recMissing").await, None);

    fx.soft_delete_record("rec1").await;
    assert_eq!(read("rec1").await, None);
}

#[tokio::test]
async fn test_list_record_ids_pages() {
    skip_if_no_db!();
    let fx = CatalogFixture::new().await;
    for id in ["rec3", "rec1", "rec4", "rec2"] {
        fx.insert_record(id, "x", None).await;
    }
    fx.soft_delete_record("rec4").await;

    let first = fx
        .catalog
        .list_record_ids(&fx.db_table_name, None, 2)
        .await
        .unwrap();
    assert_eq!(first, vec!["rec1", "rec2"]);

    let second = fx
        .catalog
        .list_record_ids(&fx.db_table_name, Some("rec2"), 2)
        .await
        .unwrap();
    assert_eq!(second, vec!["rec3"]);
}

#[tokio::test]
async fn test_schedule_through_pg_catalog() {
    skip_if_no_db!();
    let fx = CatalogFixture::new().await;
    let due = (Utc::now() + Duration::hours(3)).trunc_subsecs(0);
    fx.insert_record("rec1", "Pay invoice", Some(due)).await;

    let destination_id = common::create_destination(
        &fx.pool,
        &fx.table_id,
        "TIME_BASED",
        "http://127.0.0.1:9/unused",
        None,
    )
    .await;
    let rule = db::insert_rule(
        &fx.pool,
        &destination_id,
        &TriggerRule {
            id: None,
            trigger_type: TriggerType::Before,
            offset_minutes: 15,
            field_id: "fldDue".to_string(),
            name: "Heads up".to_string(),
        },
    )
    .await
    .unwrap();

    let ports = Ports::from_catalog(Arc::new(fx.catalog.clone()));
    let scheduler = ScheduleComputer::new(fx.pool.clone(), ports, 3);
    let outcome = scheduler
        .handle_event(&RecordEvent {
            table_id: fx.table_id.clone(),
            record_ids: vec!["rec1".to_string()],
            event_type: RecordEventType::CreateRecord,
            updated_field_ids: Vec::new(),
            destination_id: None,
            rule_id: None,
        })
        .await
        .unwrap();
    assert_eq!(outcome.scheduled, 1);

    let triggers = db::list_triggers_for_rule_record(&fx.pool, &rule.id, "rec1")
        .await
        .unwrap();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].scheduled_time, due - Duration::minutes(15));
    assert_eq!(triggers[0].original_time, due);
}
