//! Operator notifications
//!
//! Delivery is best effort: failures are logged and never reach the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        tracing::info!("[notify] {}: {}", subject, body);
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    body: &'a str,
}

/// POSTs `{"subject", "body"}` to a webhook
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default webhook client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let payload = WebhookPayload { subject, body };

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!("Notification sent: {}", subject);
            }
            Ok(response) => {
                tracing::warn!(
                    "Notification webhook returned {} for {:?}",
                    response.status(),
                    subject
                );
            }
            Err(e) => {
                tracing::warn!("Failed to send notification {:?}: {}", subject, e);
            }
        }
    }
}
