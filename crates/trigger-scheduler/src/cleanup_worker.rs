// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker purging retired trigger instances.
//!
//! FIRED, CANCELLED and terminally FAILED instances are soft-deleted when they
//! reach their final state. Once `deleted_time` is older than the retention
//! window they are hard-deleted in bounded batches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::db;
use crate::error::{Error, Result};

/// Configuration for the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// Whether cleanup runs at all.
    pub enabled: bool,
    /// How often to run cleanup.
    pub poll_interval: Duration,
    /// Retention of soft-deleted instances.
    pub max_age: Duration,
    /// Rows deleted per statement.
    pub batch_size: i64,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval: Duration::from_secs(3600),     // 1 hour
            max_age: Duration::from_secs(30 * 24 * 3600), // 30 days
            batch_size: 500,
        }
    }
}

impl CleanupWorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TRIGGER_CLEANUP_ENABLED`: "true" or "1" to enable (default: false)
    /// - `TRIGGER_CLEANUP_POLL_INTERVAL_SECS`: seconds between runs (default: 3600)
    /// - `TRIGGER_CLEANUP_MAX_AGE_DAYS`: retention in days (default: 30)
    /// - `TRIGGER_CLEANUP_BATCH_SIZE`: rows per batch (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let enabled = std::env::var("TRIGGER_CLEANUP_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(defaults.enabled);

        let poll_interval_secs = std::env::var("TRIGGER_CLEANUP_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.poll_interval.as_secs());

        let max_age_days = std::env::var("TRIGGER_CLEANUP_MAX_AGE_DAYS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let batch_size = std::env::var("TRIGGER_CLEANUP_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|size: &i64| *size > 0)
            .unwrap_or(defaults.batch_size);

        Self {
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_age: Duration::from_secs(max_age_days * 24 * 3600),
            batch_size,
        }
    }
}

/// Background worker that purges old retired instances.
pub struct CleanupWorker {
    pool: PgPool,
    config: CleanupWorkerConfig,
    shutdown: Arc<Notify>,
}

impl CleanupWorker {
    /// Create a cleanup worker.
    pub fn new(pool: PgPool, config: CleanupWorkerConfig) -> Self {
        Self {
            pool,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown. Returns immediately when disabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Trigger cleanup worker disabled");
            return;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_age_days = self.config.max_age.as_secs() / 86400,
            batch_size = self.config.batch_size,
            "Trigger cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Trigger cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.purge_once().await {
                        error!(error = %e, "Failed to purge retired triggers");
                    }
                }
            }
        }

        info!("Trigger cleanup worker stopped");
    }

    /// Delete every retired instance older than the retention window.
    ///
    /// Returns the number of rows deleted.
    pub async fn purge_once(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.max_age)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let mut total_deleted = 0u64;

        loop {
            let deleted =
                db::purge_deleted_before(&self.pool, cutoff, self.config.batch_size).await?;
            total_deleted += deleted;

            debug!(
                deleted = deleted,
                total_deleted = total_deleted,
                "Purged batch of retired triggers"
            );

            if deleted < self.config.batch_size as u64 {
                break;
            }
        }

        if total_deleted > 0 {
            info!(
                total_deleted = total_deleted,
                cutoff = %cutoff,
                "Trigger cleanup cycle completed"
            );
        } else {
            debug!("Trigger cleanup cycle completed, nothing to purge");
        }

        Ok(total_deleted)
    }
}
