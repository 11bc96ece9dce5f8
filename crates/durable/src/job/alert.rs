//! Operator alerting for failed jobs

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::reliability::client_with_timeout;

/// Topic used for job failure alerts
pub const SYSTEM_TOPIC: &str = "system";

/// Message sent to the operator notification channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub message: String,
    pub topic: String,
}

impl Alert {
    /// Alert on the `system` topic
    pub fn system(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            topic: SYSTEM_TOPIC.to_string(),
        }
    }
}

/// Error from alert delivery
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    /// Transport failure talking to the notification channel
    #[error("alert delivery failed: {0}")]
    Delivery(String),

    /// Channel answered with a non-success status
    #[error("alert channel rejected message with status {0}")]
    Rejected(u16),
}

/// Fire-and-forget notification channel
///
/// Callers log delivery errors and move on; alerts are never retried.
#[async_trait]
pub trait AlertSink: Send + Sync + 'static {
    async fn notify(&self, alert: Alert) -> Result<(), AlertError>;
}

/// Sink that only writes alerts to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn notify(&self, alert: Alert) -> Result<(), AlertError> {
        error!(topic = %alert.topic, "ALERT: {}", alert.message);
        Ok(())
    }
}

/// Sink that posts `{message, topic}` JSON to an operator webhook
#[derive(Debug, Clone)]
pub struct WebhookAlertSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertSink {
    /// Create a sink posting to `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(client_with_timeout(Duration::from_secs(10)), url)
    }

    /// Create a sink reusing an existing HTTP client
    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, alert: Alert) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(&alert)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "alert webhook rejected message");
            return Err(AlertError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Sink that keeps alerts in memory (for testing)
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts received so far
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn notify(&self, alert: Alert) -> Result<(), AlertError> {
        self.alerts.lock().push(alert);
        Ok(())
    }
}
