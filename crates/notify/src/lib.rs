//! Notifications for self-healing outcomes.
//!
//! Delivery is best-effort: each channel gets one attempt plus at most one
//! retry, and a failure never blocks the healing path.
//!
//! # Usage
//!
//! ```no_run
//! use healer_notify::{HealingMessage, Notifier, Outcome};
//!
//! # async fn run() {
//! let notifier = Notifier::from_env();
//!
//! let message = HealingMessage {
//!     resource_id: "i-0abc".to_string(),
//!     resource_kind: "compute".to_string(),
//!     action: "reboot".to_string(),
//!     outcome: Outcome::Success,
//!     attempt_count: 1,
//!     max_attempts: 3,
//!     timestamp: chrono::Utc::now(),
//!     detail: "instance running after reboot".to_string(),
//! };
//!
//! if let Err(e) = notifier.deliver(&message).await {
//!     tracing::warn!(error = %e, "notification dropped");
//! }
//! # }
//! ```
//!
//! # Configuration
//!
//! - `HEALER_WEBHOOK_URL`: JSON webhook endpoint (enables the webhook channel)
//! - `SLACK_WEBHOOK_URL`: Slack incoming webhook (enables the Slack channel)
//! - `NOTIFY_DISABLED`: Set to "true" to disable all notifications

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::slack::SlackChannel;
pub use channels::webhook::WebhookChannel;
pub use channels::NotifyChannel;
pub use error::{ChannelError, NotifyError};
pub use events::{HealingMessage, Outcome, Severity};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";

/// Pause before the single retry of a failed channel.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Longest `Retry-After` honoured. A channel asking for more is not retried.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Central notification dispatcher.
#[derive(Clone)]
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    disabled: bool,
    retry_delay: Duration,
}

impl Notifier {
    /// Create a new notifier from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Notifications disabled via NOTIFY_DISABLED");
            return Self::disabled();
        }

        let mut channels: Vec<Arc<dyn NotifyChannel>> = vec![];

        let webhook = WebhookChannel::from_env();
        if webhook.enabled() {
            info!("Webhook notifications enabled");
            channels.push(Arc::new(webhook));
        }

        let slack = SlackChannel::from_env();
        if slack.enabled() {
            info!("Slack notifications enabled");
            channels.push(Arc::new(slack));
        }

        if channels.is_empty() {
            warn!("No notification channels configured");
        }

        Self::with_channels(channels)
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            disabled: false,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Create a disabled notifier.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the pause before a retry.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Check if any notification channels are enabled.
    #[must_use]
    pub fn has_channels(&self) -> bool {
        !self.disabled && !self.channels.is_empty()
    }

    /// Get the number of enabled channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Deliver to every enabled channel, retrying each failed channel once.
    ///
    /// # Errors
    /// Returns [`NotifyError::Unavailable`] naming the channels that failed
    /// twice. Channels that succeeded are not re-sent.
    pub async fn deliver(&self, message: &HealingMessage) -> Result<(), NotifyError> {
        if !self.has_channels() {
            debug!("No active notification channels, skipping message");
            return Ok(());
        }

        let mut failed = vec![];
        let mut reason = String::new();

        for channel in self.channels.iter().filter(|c| c.enabled()) {
            let name = channel.name();

            let first = match channel.send(message).await {
                Ok(()) => {
                    debug!(channel = name, "Notification sent");
                    continue;
                }
                Err(e) => e,
            };

            let delay = match &first {
                ChannelError::RateLimited { retry_after_secs } => {
                    let wanted = Duration::from_secs(*retry_after_secs);
                    if wanted > MAX_RETRY_AFTER {
                        warn!(channel = name, retry_after_secs, "Rate limited past the retry budget, dropping");
                        failed.push(name.to_string());
                        reason = first.to_string();
                        continue;
                    }
                    self.retry_delay.max(wanted)
                }
                _ => self.retry_delay,
            };
            debug!(channel = name, error = %first, delay_ms = delay.as_millis(), "Retrying notification");
            tokio::time::sleep(delay).await;

            if let Err(e) = channel.send(message).await {
                warn!(channel = name, error = %e, "Notification failed after retry");
                failed.push(name.to_string());
                reason = e.to_string();
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(NotifyError::Unavailable {
                channels: failed,
                reason,
            })
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}
