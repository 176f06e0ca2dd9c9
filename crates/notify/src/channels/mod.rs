//! Notification channel implementations.

pub mod slack;
pub mod webhook;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::HealingMessage;

/// Trait for notification channels (webhook, Slack, etc.).
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Send one message.
    async fn send(&self, message: &HealingMessage) -> Result<(), ChannelError>;
}
