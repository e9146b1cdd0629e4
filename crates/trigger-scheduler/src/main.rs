// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger Scheduler - standalone processor
//!
//! Runs the trigger processor and cleanup worker against a shared Postgres
//! database, reading tables and records through the host product's schema.

use std::sync::Arc;
use tracing::{info, warn};

use trigger_scheduler::config::Config;
use trigger_scheduler::migrations;
use trigger_scheduler::ports::{PgCatalog, Ports};
use trigger_scheduler::runtime::TriggerRuntime;
use trigger_scheduler::webhook::HttpWebhookSender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trigger_scheduler=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        poll_interval_secs = config.processor.poll_interval.as_secs(),
        batch_size = config.processor.batch_size,
        max_concurrency = config.processor.max_concurrency,
        max_retries = config.processor.max_retries,
        "Starting Trigger Scheduler"
    );

    if (config.db_max_connections as usize) <= config.processor.max_concurrency {
        warn!(
            db_max_connections = config.db_max_connections,
            max_concurrency = config.processor.max_concurrency,
            "Pool is not larger than the worker pool; deliveries will wait for connections"
        );
    }

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    let ports = Ports::from_catalog(Arc::new(PgCatalog::new(pool.clone())));
    let sender = Arc::new(HttpWebhookSender::new(config.processor.webhook_timeout));

    let runtime = TriggerRuntime::builder()
        .pool(pool)
        .ports(ports)
        .sender(sender)
        .processor_config(config.processor)
        .cleanup_config(config.cleanup)
        .build()?
        .start()
        .await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Trigger Scheduler shut down");

    Ok(())
}
