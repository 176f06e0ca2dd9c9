//! Generic JSON webhook channel.
//!
//! Posts the [`HealingMessage`] unchanged. Suitable for SNS HTTP(S)
//! endpoints, incident tooling and anything else that accepts JSON.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::HealingMessage;
use crate::NotifyChannel;

/// Environment variable for the webhook URL.
const ENV_WEBHOOK_URL: &str = "HEALER_WEBHOOK_URL";

/// JSON webhook notification channel.
pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a webhook channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let url = std::env::var(ENV_WEBHOOK_URL)
            .ok()
            .filter(|u| !u.trim().is_empty());

        if url.is_none() {
            debug!("Webhook notifications disabled (HEALER_WEBHOOK_URL not set)");
        }

        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a webhook channel for a specific URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, message: &HealingMessage) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_WEBHOOK_URL.to_string()))?;

        debug!(
            channel = "webhook",
            resource_id = %message.resource_id,
            outcome = %message.outcome,
            "Sending notification"
        );

        let response = self.client.post(url).json(message).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(ChannelError::RateLimited { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(channel = "webhook", status = %status, body = %body, "Webhook request failed");

        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
