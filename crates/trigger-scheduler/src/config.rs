// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for trigger-scheduler.

use std::time::Duration;

use crate::cleanup_worker::CleanupWorkerConfig;
use crate::processor::ProcessorConfig;

/// Scheduler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Maximum connections in the pool
    pub db_max_connections: u32,
    /// Poll loop and delivery settings
    pub processor: ProcessorConfig,
    /// Retention purge settings
    pub cleanup: CleanupWorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TRIGGER_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("TRIGGER_DATABASE_URL or DATABASE_URL"))?;

        let defaults = ProcessorConfig::default();

        let processor = ProcessorConfig {
            poll_interval: Duration::from_secs(parse_var(
                "TRIGGER_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            batch_size: parse_var("TRIGGER_BATCH_SIZE", defaults.batch_size)?,
            max_concurrency: parse_var("TRIGGER_MAX_CONCURRENCY", defaults.max_concurrency)?,
            webhook_timeout: Duration::from_secs(parse_var(
                "TRIGGER_WEBHOOK_TIMEOUT_SECS",
                defaults.webhook_timeout.as_secs(),
            )?),
            stuck_timeout: Duration::from_secs(parse_var(
                "TRIGGER_STUCK_TIMEOUT_SECS",
                defaults.stuck_timeout.as_secs(),
            )?),
            max_retries: parse_var("TRIGGER_MAX_RETRIES", defaults.max_retries)?,
        };

        processor.validate()?;

        // Each in-flight instance holds a connection for its transaction while
        // the ports borrow more from the same pool.
        let default_connections = u32::try_from(processor.max_concurrency)
            .unwrap_or(u32::MAX)
            .saturating_add(10);
        let db_max_connections = parse_var("TRIGGER_DB_MAX_CONNECTIONS", default_connections)?;

        Ok(Self {
            database_url,
            db_max_connections,
            processor,
            cleanup: CleanupWorkerConfig::from_env(),
        })
    }
}

/// Parse an optional numeric environment variable, falling back to `default` when unset.
fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value that failed to parse.
        value: String,
    },
}
