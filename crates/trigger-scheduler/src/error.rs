// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trigger-scheduler.

use thiserror::Error;

/// Trigger scheduler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A collaborator port (record/field/table lookup) failed.
    #[error("Port error: {0}")]
    Port(#[from] crate::ports::PortError),

    /// Webhook delivery failed.
    #[error("Webhook error: {0}")]
    Webhook(#[from] crate::webhook::WebhookError),

    /// A submitted trigger rule was rejected.
    #[error("Invalid trigger rule: {0}")]
    RuleValidation(#[from] crate::rules::RuleValidationError),

    /// Timestamp required to compute a fire time was absent.
    #[error("Timestamp is required to calculate the scheduled time")]
    MissingTimestamp,

    /// Destination was not found.
    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    /// Rule was not found.
    #[error("Trigger rule not found: {0}")]
    RuleNotFound(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the trigger scheduler Error.
pub type Result<T> = std::result::Result<T, Error>;
