//! Side-channel delivery of finished results (human answers, agent output).

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ExecError, ExecResult};
use crate::types::DeliveryTarget;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, target: &DeliveryTarget, payload: &Value) -> ExecResult<()>;
}

/// POSTs the payload as JSON to the target URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, target: &DeliveryTarget, payload: &Value) -> ExecResult<()> {
        let mut builder = self.client.post(&target.url).json(payload);
        for (name, value) in &target.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExecError::Delivery(format!(
            "{} responded {status}: {}",
            target.url,
            body.chars().take(200).collect::<String>()
        )))
    }
}

/// Drops every delivery. Used when no notifier is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn deliver(&self, target: &DeliveryTarget, _payload: &Value) -> ExecResult<()> {
        tracing::debug!(url = %target.url, "no notifier configured, dropping delivery");
        Ok(())
    }
}
