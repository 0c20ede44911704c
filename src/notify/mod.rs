//! Alert delivery for fleet-level events
//!
//! Low balances, fleet exhaustion and funding failures are pushed to a
//! notification sink. A Slack incoming webhook is used when one is configured,
//! otherwise alerts only go to the log.

use crate::config::AlertsConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> RelayerResult<()>;
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
}

/// Posts alerts to a Slack incoming webhook
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> RelayerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayerError::Notification(e.to_string()))?;

        Ok(Self {
            client,
            webhook_url,
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) -> RelayerResult<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&SlackMessage { text: message })
            .send()
            .await
            .map_err(|e| RelayerError::Notification(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RelayerError::Notification(format!(
            "webhook returned {}: {}",
            status, body
        )))
    }
}

/// Writes alerts to the log only
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str) -> RelayerResult<()> {
        warn!(alert = true, "{}", message);
        Ok(())
    }
}

/// Build the notifier for the configured alert sink
pub fn from_config(config: &AlertsConfig) -> RelayerResult<Arc<dyn Notifier>> {
    match config.slack_webhook_url.as_deref() {
        Some(url) if !url.is_empty() => Ok(Arc::new(SlackNotifier::new(url.to_string())?)),
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Deliver an alert without letting a broken sink fail the caller. Delivery
/// failures are logged and counted.
pub async fn send_alert(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.notify(message).await {
        error!("Failed to deliver alert \"{}\": {}", message, e);
        crate::metrics::record_notification_failure();
    }
}
