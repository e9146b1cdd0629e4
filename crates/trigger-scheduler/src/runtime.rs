// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for trigger-scheduler.
//!
//! [`TriggerRuntime`] runs the trigger processor and the cleanup worker inside
//! an existing tokio application and hands out the inbound entry points
//! (schedule computer and rule reconciler) wired to the same pool and ports.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trigger_scheduler::ports::{PgCatalog, Ports};
//! use trigger_scheduler::runtime::TriggerRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let ports = Ports::from_catalog(Arc::new(PgCatalog::new(pool.clone())));
//!
//!     let runtime = TriggerRuntime::builder()
//!         .pool(pool)
//!         .ports(ports)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // Feed record mutations:
//!     // runtime.scheduler().handle_event(&event).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cleanup_worker::{CleanupWorker, CleanupWorkerConfig};
use crate::ports::Ports;
use crate::processor::{ProcessorConfig, TriggerProcessor};
use crate::rules::RuleReconciler;
use crate::scheduler::ScheduleComputer;
use crate::webhook::{HttpWebhookSender, WebhookSender};

/// Builder for creating a [`TriggerRuntime`].
#[derive(Default)]
pub struct TriggerRuntimeBuilder {
    pool: Option<PgPool>,
    ports: Option<Ports>,
    sender: Option<Arc<dyn WebhookSender>>,
    processor_config: ProcessorConfig,
    cleanup_config: CleanupWorkerConfig,
}

impl TriggerRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the PostgreSQL connection pool (required).
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the collaborator ports (required).
    pub fn ports(mut self, ports: Ports) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Set the webhook sender.
    ///
    /// Default: [`HttpWebhookSender`] with the processor's webhook timeout.
    pub fn sender(mut self, sender: Arc<dyn WebhookSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Set the processor configuration.
    pub fn processor_config(mut self, config: ProcessorConfig) -> Self {
        self.processor_config = config;
        self
    }

    /// Set the cleanup worker configuration.
    ///
    /// Default: disabled.
    pub fn cleanup_config(mut self, config: CleanupWorkerConfig) -> Self {
        self.cleanup_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<TriggerRuntimeConfig> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        let ports = self
            .ports
            .ok_or_else(|| anyhow::anyhow!("ports are required"))?;
        self.processor_config.validate()?;

        let sender = self.sender.unwrap_or_else(|| {
            Arc::new(HttpWebhookSender::new(self.processor_config.webhook_timeout))
        });

        Ok(TriggerRuntimeConfig {
            pool,
            ports,
            sender,
            processor_config: self.processor_config,
            cleanup_config: self.cleanup_config,
        })
    }
}

/// Configuration for a [`TriggerRuntime`].
pub struct TriggerRuntimeConfig {
    pool: PgPool,
    ports: Ports,
    sender: Arc<dyn WebhookSender>,
    processor_config: ProcessorConfig,
    cleanup_config: CleanupWorkerConfig,
}

impl TriggerRuntimeConfig {
    /// Start the runtime, spawning the processor and cleanup worker tasks.
    pub async fn start(self) -> Result<TriggerRuntime> {
        let scheduler = ScheduleComputer::new(
            self.pool.clone(),
            self.ports.clone(),
            self.processor_config.max_retries,
        );
        let reconciler = RuleReconciler::new(
            self.pool.clone(),
            self.ports.fields.clone(),
            scheduler.clone(),
        );

        let poll_interval = self.processor_config.poll_interval;
        let processor = TriggerProcessor::new(
            self.pool.clone(),
            self.ports.clone(),
            self.sender.clone(),
            self.processor_config,
        );
        let processor_shutdown = processor.shutdown_handle();
        let processor_handle = tokio::spawn(async move {
            processor.run().await;
        });

        let cleanup_worker = CleanupWorker::new(self.pool.clone(), self.cleanup_config);
        let cleanup_shutdown = cleanup_worker.shutdown_handle();
        let cleanup_handle = tokio::spawn(async move {
            cleanup_worker.run().await;
        });

        info!(
            poll_interval_secs = poll_interval.as_secs(),
            "TriggerRuntime started"
        );

        Ok(TriggerRuntime {
            processor_handle,
            cleanup_handle,
            processor_shutdown,
            cleanup_shutdown,
            scheduler,
            reconciler,
        })
    }
}

/// A running trigger scheduler embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct TriggerRuntime {
    processor_handle: JoinHandle<()>,
    cleanup_handle: JoinHandle<()>,
    processor_shutdown: Arc<Notify>,
    cleanup_shutdown: Arc<Notify>,
    scheduler: ScheduleComputer,
    reconciler: RuleReconciler,
}

impl TriggerRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> TriggerRuntimeBuilder {
        TriggerRuntimeBuilder::new()
    }

    /// Schedule computer for record mutation events.
    pub fn scheduler(&self) -> &ScheduleComputer {
        &self.scheduler
    }

    /// Rule reconciler for destination configuration changes.
    pub fn reconciler(&self) -> &RuleReconciler {
        &self.reconciler
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the processor and cleanup worker, then waits for the batch in
    /// progress to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("TriggerRuntime shutting down...");

        self.processor_shutdown.notify_one();
        self.cleanup_shutdown.notify_one();

        if let Err(e) = self.processor_handle.await {
            error!("Trigger processor task panicked: {}", e);
        }

        if let Err(e) = self.cleanup_handle.await {
            error!("Cleanup worker task panicked: {}", e);
        }

        info!("TriggerRuntime shutdown complete");
        Ok(())
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.processor_handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_rejects_zero_max_retries() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let ports = Ports::from_catalog(Arc::new(crate::ports::InMemoryCatalog::new()));

        let err = TriggerRuntime::builder()
            .pool(pool)
            .ports(ports)
            .processor_config(ProcessorConfig {
                max_retries: 0,
                ..Default::default()
            })
            .build()
            .err()
            .unwrap();
        assert!(err.to_string().contains("TRIGGER_MAX_RETRIES"));
    }

    #[test]
    fn test_build_requires_pool() {
        let err = TriggerRuntime::builder().build().err().unwrap();
        assert!(err.to_string().contains("pool is required"));
    }
}
