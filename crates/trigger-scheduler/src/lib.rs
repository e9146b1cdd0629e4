// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger Scheduler - Time-Based Webhook Triggers
//!
//! Converts a per-record timestamp plus a user-defined offset rule into a
//! future webhook delivery, persists that intent in Postgres and delivers it
//! at least once under crashes and concurrent processors.
//!
//! # Architecture
//!
//! ```text
//!   destination config            record mutations
//!          │                             │
//!          ▼                             ▼
//! ┌──────────────────┐  backfill  ┌──────────────────┐
//! │  RuleReconciler  │───────────▶│ ScheduleComputer │
//! └──────────────────┘            └──────────────────┘
//!          │                             │ cancel / insert
//!          ▼                             ▼
//! ┌───────────────────────────────────────────────────────┐
//! │                      PostgreSQL                        │
//! │   data_streams   trigger_schedules   scheduled_triggers│
//! └───────────────────────────────────────────────────────┘
//!                                        ▲ claim (SKIP LOCKED)
//!                                        │ terminal write
//!                              ┌──────────────────┐
//!                              │ TriggerProcessor │──▶ validate ──▶ webhook POST
//!                              └──────────────────┘
//! ```
//!
//! Tables, fields and records belong to the host product and are read
//! through the [`ports`] traits.
//!
//! # Instance lifecycle
//!
//! | From | To | When |
//! |------|----|------|
//! | - | `PENDING` | Schedule computer inserts a new instance |
//! | `PENDING` | `PROCESSING` | Processor claims a due instance |
//! | `PROCESSING` | `FIRED` | Webhook answered 2xx |
//! | `PROCESSING` | `CANCELLED` | Fire-time validation failed |
//! | `PROCESSING` | `FAILED` | Delivery failed; retried while attempts remain |
//! | `FAILED` | `PROCESSING` | Retry time reached |
//! | `PROCESSING` | `PENDING` | Stuck past the recovery timeout |
//! | `PENDING` | `CANCELLED` | Superseded, record deleted, rule edited or deleted |
//!
//! # Modules
//!
//! - [`config`]: environment configuration
//! - [`db`]: queries against the owned tables
//! - [`model`]: rules, destinations and instances
//! - [`ports`]: record, field and table lookups
//! - [`rules`]: rule validation and reconciliation
//! - [`scheduler`]: schedule computer
//! - [`processor`]: poll loop and per-instance pipeline
//! - [`validator`]: fire-time checks
//! - [`webhook`]: delivery
//! - [`recovery`], [`cleanup_worker`]: maintenance
//! - [`runtime`]: embeddable runtime

#![deny(missing_docs)]

pub mod cleanup_worker;
pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod model;
pub mod ports;
pub mod processor;
pub mod recovery;
pub mod rules;
pub mod runtime;
pub mod scheduler;
pub mod timing;
pub mod validator;
pub mod webhook;

pub use error::{Error, Result};
pub use model::{
    Destination, PersistedRule, RecordEvent, RecordEventType, ScheduledTrigger, TriggerRule,
    TriggerState, TriggerType,
};
pub use processor::{PollSummary, ProcessorConfig, TriggerProcessor};
pub use rules::{RuleChanges, RuleReconciler, reconcile_rules};
pub use runtime::TriggerRuntime;
pub use scheduler::ScheduleComputer;
