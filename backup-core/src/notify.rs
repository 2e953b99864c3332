//! Fire-and-forget webhook notifications.

use crate::config::{NotificationConfig, StorageConfig};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Started,
    Success,
    Warning,
    Failure,
}

/// JSON body accepted by the webhook.
#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    pub timestamp: String,
    pub service: &'a str,
    pub status: NotifyStatus,
    pub message: &'a str,
    pub environment: &'a str,
    pub namespace: &'a str,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    environment: String,
    namespace: String,
}

impl Notifier {
    pub fn new(notification: &NotificationConfig, storage: &StorageConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(notification.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            webhook_url: notification.webhook_url.clone(),
            environment: storage.environment.clone(),
            namespace: storage.namespace.clone(),
        }
    }

    /// A notifier that only logs.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: None,
            environment: String::new(),
            namespace: String::new(),
        }
    }

    pub fn payload<'a>(
        &'a self,
        status: NotifyStatus,
        service: &'a str,
        message: &'a str,
    ) -> NotificationPayload<'a> {
        NotificationPayload {
            timestamp: chrono::Utc::now().to_rfc3339(),
            service,
            status,
            message,
            environment: &self.environment,
            namespace: &self.namespace,
        }
    }

    /// Deliver a notification. Delivery failures are logged and swallowed.
    pub async fn notify(&self, status: NotifyStatus, service: &str, message: &str) {
        let Some(url) = self.webhook_url.as_deref() else {
            tracing::debug!(service, ?status, "Notification skipped (no webhook): {}", message);
            return;
        };

        let body = self.payload(status, service, message);
        match self.client.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(service, ?status, "Notification delivered");
            }
            Ok(resp) => {
                tracing::warn!(service, "Notification webhook returned status {}", resp.status());
            }
            Err(e) => {
                tracing::warn!(service, "Failed to deliver notification: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let storage = StorageConfig {
            environment: "staging".into(),
            namespace: "platform".into(),
            ..StorageConfig::default()
        };
        let notifier = Notifier::new(&NotificationConfig::default(), &storage);
        let payload = notifier.payload(NotifyStatus::Failure, "redis", "snapshot failed");
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["service"], "redis");
        assert_eq!(json["status"], "failure");
        assert_eq!(json["message"], "snapshot failed");
        assert_eq!(json["environment"], "staging");
        assert_eq!(json["namespace"], "platform");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_swallowed() {
        let notification = NotificationConfig {
            webhook_url: Some("http://127.0.0.1:9/hook".into()),
            timeout_secs: 1,
        };
        let notifier = Notifier::new(&notification, &StorageConfig::default());
        // Must return without panicking or propagating an error.
        notifier.notify(NotifyStatus::Success, "postgres", "done").await;
        Notifier::disabled()
            .notify(NotifyStatus::Warning, "postgres", "no webhook")
            .await;
    }
}
