// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook delivery.
//!
//! Deliveries are JSON POSTs bounded by a fixed timeout. Any 2xx response is
//! success; everything else (non-2xx, network error, timeout) is a failure the
//! processor retries.
//!
//! Headers sent with every delivery:
//! - `X-Trigger-Id`: instance ID, stable across retries
//! - `X-Trigger-Timestamp`: send time, unix seconds
//! - `X-Trigger-Signature`: `sha256=<base64 HMAC-SHA256(body)>`, only when the
//!   destination has a signing secret

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::model::{PersistedRule, ScheduledTrigger};
use crate::ports::RecordSnapshot;

type HmacSha256 = Hmac<Sha256>;

/// Value of the `kind` field in every envelope.
pub const TRIGGER_KIND: &str = "time_based_trigger";

/// Header carrying the instance ID.
pub const HEADER_TRIGGER_ID: &str = "X-Trigger-Id";
/// Header carrying the send time.
pub const HEADER_TIMESTAMP: &str = "X-Trigger-Timestamp";
/// Header carrying the body signature.
pub const HEADER_SIGNATURE: &str = "X-Trigger-Signature";

/// Errors from webhook delivery.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// No response within the delivery timeout.
    #[error("Webhook timed out after {0:?}")]
    Timeout(Duration),

    /// Receiver answered with a non-success status.
    #[error("Webhook returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },

    /// Request could not be sent.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Payload could not be serialized.
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Signing key rejected.
    #[error("Failed to sign payload: {0}")]
    Signing(String),
}

/// Trigger metadata delivered alongside the record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    /// Fire time the instance was scheduled for.
    pub scheduled_time: DateTime<Utc>,
    /// Field value the fire time was computed from.
    pub original_time: DateTime<Utc>,
    /// Failed attempts before this one.
    pub retry_count: i32,
    /// Whether this attempt is a retry.
    pub is_retry: bool,
    /// Rule that produced the instance (`null` if deleted since).
    pub rule: Option<PersistedRule>,
}

/// Inner payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerPayload {
    /// Base the table belongs to.
    pub base_id: String,
    /// Table ID.
    pub table_id: String,
    /// Current record snapshot.
    pub record: RecordSnapshot,
    /// Trigger metadata.
    pub trigger_info: TriggerInfo,
}

/// Top-level webhook body.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEnvelope {
    /// Table ID.
    pub source: String,
    /// Always [`TRIGGER_KIND`].
    pub kind: &'static str,
    /// Payload.
    pub payload: TriggerPayload,
}

impl WebhookEnvelope {
    /// Build the envelope for one instance.
    pub fn new(
        trigger: &ScheduledTrigger,
        base_id: &str,
        record: RecordSnapshot,
        rule: Option<PersistedRule>,
    ) -> Self {
        Self {
            source: trigger.table_id.clone(),
            kind: TRIGGER_KIND,
            payload: TriggerPayload {
                base_id: base_id.to_string(),
                table_id: trigger.table_id.clone(),
                record,
                trigger_info: TriggerInfo {
                    scheduled_time: trigger.scheduled_time,
                    original_time: trigger.original_time,
                    retry_count: trigger.retry_count,
                    is_retry: trigger.is_retry(),
                    rule,
                },
            },
        }
    }
}

/// One delivery attempt.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    /// Target URL.
    pub url: String,
    /// Instance ID, sent as `X-Trigger-Id`.
    pub trigger_id: String,
    /// HMAC key, when the destination signs deliveries.
    pub signing_secret: Option<String>,
    /// Body.
    pub envelope: WebhookEnvelope,
}

/// Delivers webhooks.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    /// Deliver once. `Ok` only for a 2xx response within the timeout.
    async fn send(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError>;
}

/// Compute `sha256=<base64>` over `body` with `secret`.
pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", BASE64.encode(mac.finalize().into_bytes())))
}

/// reqwest-backed sender.
#[derive(Debug, Clone)]
pub struct HttpWebhookSender {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpWebhookSender {
    /// Create a sender with the given per-delivery timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Use an existing client (shared connection pool).
    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn post(&self, delivery: &WebhookDelivery, body: Vec<u8>) -> Result<(), WebhookError> {
        let mut request = self
            .client
            .post(&delivery.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_TRIGGER_ID, &delivery.trigger_id)
            .header(HEADER_TIMESTAMP, Utc::now().timestamp().to_string());

        if let Some(secret) = &delivery.signing_secret {
            request = request.header(HEADER_SIGNATURE, sign_body(secret, &body)?);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(512)
            .collect();
        Err(WebhookError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(&self, delivery: &WebhookDelivery) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(&delivery.envelope)?;

        debug!(
            trigger_id = %delivery.trigger_id,
            url = %delivery.url,
            bytes = body.len(),
            "Sending webhook"
        );

        tokio::time::timeout(self.timeout, self.post(delivery, body))
            .await
            .map_err(|_| WebhookError::Timeout(self.timeout))?
    }
}
