//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::HealingMessage;
use crate::NotifyChannel;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL).ok();

        if webhook_url.is_none() {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    /// Format a message as a Slack webhook payload.
    fn format_payload(message: &HealingMessage) -> SlackPayload {
        let fields = vec![
            SlackField {
                title: "Resource".to_string(),
                value: format!("{} ({})", message.resource_id, message.resource_kind),
                short: true,
            },
            SlackField {
                title: "Action".to_string(),
                value: message.action.clone(),
                short: true,
            },
            SlackField {
                title: "Outcome".to_string(),
                value: message.outcome.as_str().to_string(),
                short: true,
            },
            SlackField {
                title: "Attempts".to_string(),
                value: format!("{}/{}", message.attempt_count, message.max_attempts),
                short: true,
            },
        ];

        let attachment = SlackAttachment {
            fallback: message.title(),
            color: message.severity().color().to_string(),
            author_name: Some("Self-Healing".to_string()),
            title: message.title(),
            text: message.detail.clone(),
            fields,
            footer: Some(format!(
                "{} | {}",
                message.severity().as_str(),
                message.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(message.timestamp.timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, message: &HealingMessage) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_SLACK_WEBHOOK_URL.to_string()))?;

        let payload = Self::format_payload(message);

        debug!(channel = "slack", title = %message.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;

        if response.status().is_success() {
            debug!(channel = "slack", "Notification sent successfully");
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            warn!(
                channel = "slack",
                status = %status,
                body = %body,
                "Slack webhook request failed"
            );

            Err(ChannelError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

// =============================================================================
// Slack API types
// =============================================================================

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}
