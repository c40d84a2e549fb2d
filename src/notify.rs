//! Notification sinks used to deliver a captured result.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::NotifyError;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, message: &str) -> Result<(), NotifyError>;
}

#[async_trait]
impl<T> Notifier for Arc<T>
where
    T: Notifier + ?Sized,
{
    async fn publish(&self, message: &str) -> Result<(), NotifyError> {
        (**self).publish(message).await
    }
}

/// Writes notifications to the `tracing` output instead of a remote sink.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {
    topic: Option<String>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
        }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(&self, message: &str) -> Result<(), NotifyError> {
        info!(topic = self.topic.as_deref().unwrap_or("-"), %message, "notification published");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifierConfig {
    pub url: String,
    pub topic: Option<String>,
}

impl WebhookNotifierConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            topic: None,
        }
    }

    /// Reads `NOTIFY_WEBHOOK_URL` and the optional `NOTIFY_TOPIC`.
    pub fn from_env() -> Result<Self, NotifyError> {
        let url = std::env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| NotifyError::NotConfigured("NOTIFY_WEBHOOK_URL is not set".to_string()))?;
        let topic = std::env::var("NOTIFY_TOPIC")
            .ok()
            .filter(|topic| !topic.trim().is_empty());
        Ok(Self { url, topic })
    }
}

/// Publishes each message as a JSON `POST` to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    config: WebhookNotifierConfig,
}

#[derive(Debug, Serialize, PartialEq)]
struct WebhookPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
    message: &'a str,
}

impl WebhookNotifier {
    pub fn new(config: WebhookNotifierConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .build()
            .map_err(|err| NotifyError::Publish(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn from_env() -> Result<Self, NotifyError> {
        Self::new(WebhookNotifierConfig::from_env()?)
    }

    fn payload<'a>(&'a self, message: &'a str) -> WebhookPayload<'a> {
        WebhookPayload {
            topic: self.config.topic.as_deref(),
            message,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, message: &str) -> Result<(), NotifyError> {
        debug!(url = %self.config.url, bytes = message.len(), "publishing notification");

        let response = self
            .client
            .post(&self.config.url)
            .json(&self.payload(message))
            .send()
            .await
            .map_err(|err| NotifyError::Publish(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Publish(if body.is_empty() {
                format!("webhook responded {status}")
            } else {
                format!("webhook responded {status}: {body}")
            }));
        }

        Ok(())
    }
}
