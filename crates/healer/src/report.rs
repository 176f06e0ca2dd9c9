//! Outcome reporting through the notification channels.

use chrono::Utc;
use healer_cloud::ResourceKind;
use healer_notify::{HealingMessage, Notifier, Outcome};
use tracing::debug;

use crate::error::{HealError, Result};
use crate::types::ActionKind;

/// Builds healing messages and hands them to the [`Notifier`].
pub struct Reporter {
    notifier: Notifier,
    max_attempts: u32,
}

impl Reporter {
    pub fn new(notifier: Notifier, max_attempts: u32) -> Self {
        Self {
            notifier,
            max_attempts,
        }
    }

    /// Deliver one outcome. Best-effort: the caller decides what to do with
    /// [`HealError::NotificationUnavailable`].
    pub async fn notify(
        &self,
        resource_id: &str,
        resource_kind: ResourceKind,
        action: Option<ActionKind>,
        outcome: Outcome,
        attempt_count: u32,
        detail: &str,
    ) -> Result<()> {
        let message = HealingMessage {
            resource_id: resource_id.to_string(),
            resource_kind: resource_kind.to_string(),
            action: action.map_or("none", ActionKind::as_str).to_string(),
            outcome,
            attempt_count,
            max_attempts: self.max_attempts,
            timestamp: Utc::now(),
            detail: detail.to_string(),
        };

        debug!(resource_id, outcome = %outcome, "Reporting outcome");
        self.notifier
            .deliver(&message)
            .await
            .map_err(HealError::NotificationUnavailable)
    }
}
