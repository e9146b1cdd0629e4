// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for trigger-scheduler integration tests.
//!
//! Every [`TestContext`] gets its own table, destination and in-memory
//! catalog so tests sharing one database do not see each other's rows.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use trigger_scheduler::db::{self, NewScheduledTrigger};
use trigger_scheduler::model::{PersistedRule, RowStatus, ScheduledTrigger, TriggerRule, TriggerType};
use trigger_scheduler::ports::{FieldInfo, InMemoryCatalog, Ports, TableInfo};
use trigger_scheduler::scheduler::ScheduleComputer;
use trigger_scheduler::webhook::{WebhookDelivery, WebhookError, WebhookSender};

pub const DATE_FIELD: &str = "fldDue";
pub const DATE_COLUMN: &str = "due_date";
pub const VIEW_ID: &str = "viwDefault";
pub const MAX_RETRIES: i32 = 3;

/// Get a migrated pool, or `None` when no test database is configured.
pub async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_TRIGGER_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    trigger_scheduler::migrations::run(&pool).await.ok()?;
    Some(pool)
}

/// Insert a destination row and return its ID.
pub async fn create_destination(
    pool: &PgPool,
    table_id: &str,
    strategy: &str,
    webhook_url: &str,
    signing_secret: Option<&str>,
) -> String {
    let id = format!("dst{}", Uuid::new_v4().simple());
    sqlx::query(
        r#"
        INSERT INTO data_streams (id, table_id, name, webhook_url, strategy, signing_secret)
        VALUES ($1, $2, 'Test destination', $3, $4, $5)
        "#,
    )
    .bind(&id)
    .bind(table_id)
    .bind(webhook_url)
    .bind(strategy)
    .bind(signing_secret)
    .execute(pool)
    .await
    .expect("Failed to create destination");
    id
}

/// Per-test world: one table with a date field, one TIME_BASED destination.
pub struct TestContext {
    pub pool: PgPool,
    pub catalog: Arc<InMemoryCatalog>,
    pub ports: Ports,
    pub table_id: String,
    pub db_table_name: String,
    pub destination_id: String,
}

impl TestContext {
    pub async fn new() -> Option<Self> {
        Self::with_webhook_url("http://127.0.0.1:9/unused").await
    }

    pub async fn with_webhook_url(webhook_url: &str) -> Option<Self> {
        let pool = get_test_pool().await?;
        let suffix = Uuid::new_v4().simple().to_string();
        let table_id = format!("tbl{}", suffix);
        let db_table_name = format!("bseTest.tasks_{}", suffix);

        let catalog = Arc::new(InMemoryCatalog::new());
        catalog
            .add_table(
                TableInfo {
                    id: table_id.clone(),
                    base_id: "bseTest".to_string(),
                    db_table_name: db_table_name.clone(),
                },
                VIEW_ID,
            )
            .await;
        catalog
            .add_field(
                &table_id,
                FieldInfo {
                    id: DATE_FIELD.to_string(),
                    field_type: "date".to_string(),
                    db_field_name: DATE_COLUMN.to_string(),
                    status: RowStatus::Active,
                },
            )
            .await;

        let destination_id =
            create_destination(&pool, &table_id, "TIME_BASED", webhook_url, None).await;
        let ports = Ports::from_catalog(catalog.clone());

        Some(Self {
            pool,
            catalog,
            ports,
            table_id,
            db_table_name,
            destination_id,
        })
    }

    pub fn scheduler(&self) -> ScheduleComputer {
        ScheduleComputer::new(self.pool.clone(), self.ports.clone(), MAX_RETRIES)
    }

    /// Insert or replace a record carrying the date field.
    pub async fn put_record(&self, record_id: &str, due: Option<DateTime<Utc>>) {
        self.catalog
            .put_record(&self.table_id, record_id, serde_json::Map::new())
            .await;
        self.catalog
            .set_timestamp(&self.table_id, record_id, DATE_COLUMN, due)
            .await;
    }

    pub async fn create_rule(&self, trigger_type: TriggerType, offset_minutes: i32) -> PersistedRule {
        let rule = TriggerRule {
            id: None,
            trigger_type,
            offset_minutes,
            field_id: DATE_FIELD.to_string(),
            name: format!("{} {}", trigger_type, offset_minutes),
        };
        db::insert_rule(&self.pool, &self.destination_id, &rule)
            .await
            .expect("Failed to insert rule")
    }

    /// All instances for the pair, oldest first.
    pub async fn triggers(&self, rule_id: &str, record_id: &str) -> Vec<ScheduledTrigger> {
        db::list_triggers_for_rule_record(&self.pool, rule_id, record_id)
            .await
            .expect("Failed to list triggers")
    }

    pub async fn active_triggers(&self, rule_id: &str, record_id: &str) -> Vec<ScheduledTrigger> {
        self.triggers(rule_id, record_id)
            .await
            .into_iter()
            .filter(|t| t.status == RowStatus::Active)
            .collect()
    }

    /// Insert a PENDING instance directly, bypassing the schedule computer.
    pub async fn insert_trigger(
        &self,
        rule_id: &str,
        record_id: &str,
        scheduled_time: DateTime<Utc>,
        original_time: DateTime<Utc>,
    ) -> String {
        db::insert_scheduled_trigger(
            &self.pool,
            &NewScheduledTrigger {
                destination_id: self.destination_id.clone(),
                rule_id: rule_id.to_string(),
                record_id: record_id.to_string(),
                table_id: self.table_id.clone(),
                original_field_id: DATE_FIELD.to_string(),
                scheduled_time,
                original_time,
                max_retries: MAX_RETRIES,
            },
        )
        .await
        .expect("Failed to insert trigger")
    }

    pub async fn get_trigger(&self, trigger_id: &str) -> ScheduledTrigger {
        db::get_scheduled_trigger(&self.pool, trigger_id)
            .await
            .expect("Failed to query trigger")
            .expect("Trigger not found")
    }

    /// Make a FAILED instance due for retry now.
    pub async fn make_retry_due(&self, trigger_id: &str) {
        sqlx::query(
            "UPDATE scheduled_triggers SET next_retry_time = NOW() - INTERVAL '1 second' WHERE id = $1",
        )
        .bind(trigger_id)
        .execute(&self.pool)
        .await
        .expect("Failed to update next_retry_time");
    }
}

/// Webhook sender that records deliveries and answers with a fixed result.
#[derive(Default)]
pub struct RecordingSender {
    pub deliveries: Mutex<Vec<WebhookDelivery>>,
    pub fail: bool,
}

impl RecordingSender {
    pub fn failing() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn delivered_ids(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.trigger_id.clone())
            .collect()
    }
}

#[async_trait]
impl WebhookSender for RecordingSender {
    async fn send(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        self.deliveries.lock().unwrap().push(delivery.clone());
        if self.fail {
            Err(WebhookError::Status {
                status: 500,
                body: "boom".to_string(),
            })
        } else {
            Ok(())
        }
    }
}
