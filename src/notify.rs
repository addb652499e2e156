//! Post-persistence notifications.
//!
//! After an event is persisted and committed, the worker emits a best-effort
//! notification so downstream consumers learn about it without polling.
//! Delivery is at-least-once and deliberately outside the persistence
//! transaction; the body carries `event_id` so subscribers can deduplicate.
//!
//! # Example
//!
//! ```rust,ignore
//! use fluxa::notify::WebhookNotifier;
//! use std::time::Duration;
//!
//! let notifier = WebhookNotifier::new("https://hooks.example.com/fluxa")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2);
//! ```

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default timeout for notification requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 2;

/// Notification emitted after an event is fully processed.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event_id: String,
    pub correlation_id: String,
    pub status: &'static str,
}

impl Notification {
    pub fn processed(event_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            correlation_id: correlation_id.into(),
            status: "processed",
        }
    }
}

/// Errors that can occur while publishing a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification endpoint returned status {0}")]
    Status(u16),
}

/// Publisher seam; the worker treats failures as non-fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Notifier that POSTs notifications to an HTTP endpoint.
///
/// Retries on network errors and 5xx responses; 4xx responses are final
/// (the endpoint saw the request and rejected it).
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
    timeout: Duration,
    retries: u32,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Set custom request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of retries on 5xx errors
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut last_error = None;
        let mut attempts = 0;

        while attempts <= self.retries {
            if attempts > 0 {
                debug!(
                    attempt = attempts,
                    max_retries = self.retries,
                    "Retrying notification"
                );
            }

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .header("X-Correlation-ID", &notification.correlation_id)
                .json(notification)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        info!(
                            url = %self.url,
                            event_id = %notification.event_id,
                            status = %status,
                            "Notification delivered"
                        );
                        return Ok(());
                    }

                    if status.is_client_error() {
                        warn!(
                            status = %status,
                            url = %self.url,
                            "Notification endpoint rejected request"
                        );
                        return Err(NotifyError::Status(status.as_u16()));
                    }

                    warn!(
                        status = %status,
                        url = %self.url,
                        attempt = attempts,
                        "Notification endpoint returned server error, will retry"
                    );
                    last_error = Some(NotifyError::Status(status.as_u16()));
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        url = %self.url,
                        attempt = attempts,
                        "Notification request failed"
                    );
                    last_error = Some(NotifyError::Http(e));
                }
            }

            attempts += 1;
        }

        Err(last_error.unwrap_or(NotifyError::Status(0)))
    }
}

/// Notifier that records notifications in memory, for tests.
#[derive(Default)]
pub struct RecordingNotifier {
    published: std::sync::Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Notification> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.published.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_builder() {
        let notifier = WebhookNotifier::new("https://example.com/hook")
            .with_timeout(Duration::from_secs(5))
            .with_retries(3);

        assert_eq!(notifier.url, "https://example.com/hook");
        assert_eq!(notifier.timeout, Duration::from_secs(5));
        assert_eq!(notifier.retries, 3);
    }

    #[test]
    fn test_notification_body_shape() {
        let notification = Notification::processed("evt-1", "corr-1");
        let json = serde_json::to_value(&notification).unwrap();

        assert_eq!(json["event_id"], "evt-1");
        assert_eq!(json["correlation_id"], "corr-1");
        assert_eq!(json["status"], "processed");
    }

    #[tokio::test]
    async fn test_recording_notifier_captures_publishes() {
        let notifier = RecordingNotifier::new();
        notifier
            .publish(&Notification::processed("evt-1", "corr-1"))
            .await
            .unwrap();

        let published = notifier.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_id, "evt-1");
    }
}
