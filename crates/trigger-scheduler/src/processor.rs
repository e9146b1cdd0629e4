// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger processor.
//!
//! Each tick claims due PENDING instances and due retries, then runs every
//! claimed instance through validate -> execute -> terminal write inside its
//! own transaction on a bounded worker pool. Any number of processors may
//! share one database; `FOR UPDATE SKIP LOCKED` keeps their claims disjoint.
//!
//! A failed instance never stops the rest of the batch, and a failed tick is
//! logged and retried on the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::db;
use crate::error::Result;
use crate::model::ScheduledTrigger;
use crate::ports::Ports;
use crate::recovery;
use crate::timing::retry_delay;
use crate::validator::{InvalidReason, TriggerValidator};
use crate::webhook::{WebhookDelivery, WebhookEnvelope, WebhookSender};

/// Processor configuration.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Time between polls.
    pub poll_interval: Duration,
    /// Maximum instances claimed per batch (ready and retry batches each).
    pub batch_size: i64,
    /// Instances processed concurrently.
    pub max_concurrency: usize,
    /// Per-delivery timeout.
    pub webhook_timeout: Duration,
    /// PROCESSING instances untouched for this long are reset to PENDING.
    pub stuck_timeout: Duration,
    /// Attempts allowed for newly scheduled instances.
    pub max_retries: i32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
            max_concurrency: 20,
            webhook_timeout: Duration::from_secs(30),
            stuck_timeout: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

impl ProcessorConfig {
    /// Reject settings the processor cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.batch_size < 1 {
            return Err(ConfigError::InvalidValue {
                name: "TRIGGER_BATCH_SIZE",
                value: self.batch_size.to_string(),
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                name: "TRIGGER_MAX_CONCURRENCY",
                value: "0".to_string(),
            });
        }
        if self.max_retries < 1 {
            return Err(ConfigError::InvalidValue {
                name: "TRIGGER_MAX_RETRIES",
                value: self.max_retries.to_string(),
            });
        }
        Ok(())
    }
}

/// Terminal outcome of processing one claimed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceOutcome {
    /// Webhook delivered.
    Fired,
    /// Validation failed; instance cancelled.
    Cancelled(InvalidReason),
    /// Delivery failed; another attempt is scheduled.
    RetryScheduled {
        /// Failed attempts so far.
        retry_count: i32,
    },
    /// Delivery failed and no attempts remain.
    Failed {
        /// Failed attempts so far.
        retry_count: i32,
    },
    /// Instance was superseded or reset after it was claimed.
    Skipped,
}

/// Counts from one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Instances claimed.
    pub claimed: usize,
    /// Delivered.
    pub fired: usize,
    /// Cancelled by validation.
    pub cancelled: usize,
    /// Scheduled for another attempt.
    pub retry_scheduled: usize,
    /// Failed terminally.
    pub failed: usize,
    /// No longer claimable when their turn came.
    pub skipped: usize,
    /// Processing errored (database or task failure).
    pub errors: usize,
}

impl PollSummary {
    fn record(&mut self, outcome: &InstanceOutcome) {
        match outcome {
            InstanceOutcome::Fired => self.fired += 1,
            InstanceOutcome::Cancelled(_) => self.cancelled += 1,
            InstanceOutcome::RetryScheduled { .. } => self.retry_scheduled += 1,
            InstanceOutcome::Failed { .. } => self.failed += 1,
            InstanceOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Processes one claimed instance. Cheap to clone into worker tasks.
#[derive(Clone)]
struct InstanceWorker {
    pool: PgPool,
    validator: TriggerValidator,
    sender: Arc<dyn WebhookSender>,
}

impl InstanceWorker {
    async fn process(&self, claimed: ScheduledTrigger) -> Result<InstanceOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(trigger) = db::lock_processing(&mut *tx, &claimed.id).await? else {
            debug!(trigger_id = %claimed.id, "Trigger no longer processing, skipping");
            tx.rollback().await?;
            return Ok(InstanceOutcome::Skipped);
        };

        let destination = db::get_destination(&mut *tx, &trigger.destination_id).await?;

        let validated = match self.validator.validate(&trigger, destination).await {
            Ok(validated) => validated,
            Err(reason) => {
                db::mark_cancelled(&mut *tx, &trigger.id, &reason.to_string()).await?;
                tx.commit().await?;
                info!(
                    trigger_id = %trigger.id,
                    rule_id = %trigger.rule_id,
                    record_id = %trigger.record_id,
                    reason = %reason,
                    "Trigger cancelled"
                );
                return Ok(InstanceOutcome::Cancelled(reason));
            }
        };

        let rule = db::get_rule(&mut *tx, &trigger.rule_id).await?;
        let delivery = WebhookDelivery {
            url: validated.destination.webhook_url.clone(),
            trigger_id: trigger.id.clone(),
            signing_secret: validated.destination.signing_secret.clone(),
            envelope: WebhookEnvelope::new(
                &trigger,
                &validated.table.base_id,
                validated.record,
                rule,
            ),
        };

        let outcome = match self.sender.send(&delivery).await {
            Ok(()) => {
                db::mark_fired(&mut *tx, &trigger.id).await?;
                info!(
                    trigger_id = %trigger.id,
                    rule_id = %trigger.rule_id,
                    record_id = %trigger.record_id,
                    retry_count = trigger.retry_count,
                    "Trigger fired"
                );
                InstanceOutcome::Fired
            }
            Err(e) => handle_failure(&mut *tx, &trigger, &e.to_string()).await?,
        };

        tx.commit().await?;
        Ok(outcome)
    }
}

/// Record a failed delivery: schedule a retry or fail terminally.
async fn handle_failure(
    tx: &mut sqlx::PgConnection,
    trigger: &ScheduledTrigger,
    error: &str,
) -> Result<InstanceOutcome> {
    let retry_count = trigger.retry_count.saturating_add(1);

    if retry_count >= trigger.max_retries {
        // Rows stamped with max_retries 0 still have to satisfy retry_count <= max_retries.
        let retry_count = retry_count.min(trigger.max_retries.max(trigger.retry_count));
        db::mark_failed_terminal(&mut *tx, &trigger.id, retry_count, error).await?;
        warn!(
            trigger_id = %trigger.id,
            retry_count = retry_count,
            error = %error,
            "Trigger delivery failed, no retries left"
        );
        return Ok(InstanceOutcome::Failed { retry_count });
    }

    let next_retry_time = Utc::now() + retry_delay(trigger.retry_count);
    db::schedule_retry(&mut *tx, &trigger.id, retry_count, error, next_retry_time).await?;
    warn!(
        trigger_id = %trigger.id,
        retry_count = retry_count,
        next_retry_time = %next_retry_time,
        error = %error,
        "Trigger delivery failed, retry scheduled"
    );
    Ok(InstanceOutcome::RetryScheduled { retry_count })
}

/// Most instances one tick may claim.
///
/// Claimed rows wait for a worker while already PROCESSING, so a tick claims
/// only what the pool can start before another processor's recovery would
/// consider the last of them stuck.
fn claim_budget(config: &ProcessorConfig) -> i64 {
    let delivery_secs = config.webhook_timeout.as_secs().max(1);
    let waves = (config.stuck_timeout.as_secs() / delivery_secs)
        .saturating_sub(1)
        .max(1);
    let workers = u64::try_from(config.max_concurrency.max(1)).unwrap_or(u64::MAX);
    i64::try_from(waves.saturating_mul(workers)).unwrap_or(i64::MAX)
}

/// Polls the trigger queue and delivers due instances.
pub struct TriggerProcessor {
    pool: PgPool,
    worker: InstanceWorker,
    config: ProcessorConfig,
    shutdown: Arc<Notify>,
}

impl TriggerProcessor {
    /// Create a processor.
    pub fn new(
        pool: PgPool,
        ports: Ports,
        sender: Arc<dyn WebhookSender>,
        config: ProcessorConfig,
    ) -> Self {
        let worker = InstanceWorker {
            pool: pool.clone(),
            validator: TriggerValidator::new(ports),
            sender,
        };
        Self {
            pool,
            worker,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the poll loop until shutdown is signalled.
    ///
    /// Stuck PROCESSING instances are reset before the first poll and again
    /// on every tick. A batch in progress when shutdown arrives is finished
    /// first.
    pub async fn run(&self) {
        self.recover().await;

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "Trigger processor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Trigger processor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.recover().await;
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to process due triggers");
                    }
                }
            }
        }

        info!("Trigger processor stopped");
    }

    async fn recover(&self) {
        if let Err(e) = recovery::recover_stuck_triggers(&self.pool, self.config.stuck_timeout).await
        {
            error!(error = %e, "Failed to recover stuck triggers");
        }
    }

    /// Claim and process one round of due instances.
    pub async fn run_once(&self) -> Result<PollSummary> {
        let now = Utc::now();
        let budget = claim_budget(&self.config);
        let mut claimed =
            db::claim_ready(&self.pool, now, self.config.batch_size.min(budget)).await?;

        let retry_limit = self
            .config
            .batch_size
            .min(budget.saturating_sub(claimed.len() as i64));
        if retry_limit > 0 {
            match db::claim_retries(&self.pool, now, retry_limit).await {
                Ok(retries) => claimed.extend(retries),
                Err(e) => {
                    // Ready rows are already PROCESSING; process them regardless.
                    error!(error = %e, "Failed to claim retry batch");
                }
            }
        }

        let mut summary = PollSummary {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(summary);
        }

        debug!(claimed = claimed.len(), "Claimed due triggers");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for trigger in claimed {
            let worker = self.worker.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                let trigger_id = trigger.id.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (trigger_id, Err(crate::error::Error::Other(e.to_string()))),
                };
                (trigger_id, worker.process(trigger).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => summary.record(&outcome),
                Ok((trigger_id, Err(e))) => {
                    // Left PROCESSING; recovery resets it after the stuck timeout.
                    error!(trigger_id = %trigger_id, error = %e, "Failed to process trigger");
                    summary.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "Trigger task panicked");
                    summary.errors += 1;
                }
            }
        }

        info!(
            claimed = summary.claimed,
            fired = summary.fired,
            cancelled = summary.cancelled,
            retry_scheduled = summary.retry_scheduled,
            failed = summary.failed,
            skipped = summary.skipped,
            errors = summary.errors,
            "Processed trigger batch"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProcessorConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_concurrency, 20);
        assert_eq!(config.webhook_timeout, Duration::from_secs(30));
        assert_eq!(config.stuck_timeout, Duration::from_secs(300));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(ProcessorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let cases = [
            (ProcessorConfig { batch_size: 0, ..Default::default() }, "TRIGGER_BATCH_SIZE"),
            (ProcessorConfig { batch_size: -5, ..Default::default() }, "TRIGGER_BATCH_SIZE"),
            (ProcessorConfig { max_concurrency: 0, ..Default::default() }, "TRIGGER_MAX_CONCURRENCY"),
            (ProcessorConfig { max_retries: 0, ..Default::default() }, "TRIGGER_MAX_RETRIES"),
            (ProcessorConfig { max_retries: -1, ..Default::default() }, "TRIGGER_MAX_RETRIES"),
        ];
        for (config, expected) in cases {
            match config.validate() {
                Err(ConfigError::InvalidValue { name, .. }) => assert_eq!(name, expected),
                other => panic!("expected {} to be rejected, got {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_claim_budget_fits_stuck_timeout() {
        // 300s / 30s leaves 9 full waves of 20 workers.
        assert_eq!(claim_budget(&ProcessorConfig::default()), 180);

        let slow = ProcessorConfig {
            webhook_timeout: Duration::from_secs(600),
            max_concurrency: 5,
            ..Default::default()
        };
        assert_eq!(claim_budget(&slow), 5);
    }

    #[test]
    fn test_summary_counts_outcomes() {
        let mut summary = PollSummary::default();
        summary.record(&InstanceOutcome::Fired);
        summary.record(&InstanceOutcome::Cancelled(InvalidReason::TimestampChanged));
        summary.record(&InstanceOutcome::RetryScheduled { retry_count: 1 });
        summary.record(&InstanceOutcome::Failed { retry_count: 3 });
        summary.record(&InstanceOutcome::Skipped);
        assert_eq!(
            summary,
            PollSummary {
                claimed: 0,
                fired: 1,
                cancelled: 1,
                retry_scheduled: 1,
                failed: 1,
                skipped: 1,
                errors: 0,
            }
        );
    }
}
