//! Healing notification message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity levels for notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational - normal operations
    Info,
    /// Warning - something needs attention
    Warning,
    /// Critical - manual intervention required
    Critical,
}

impl Severity {
    /// Hex color used by chat attachments.
    #[must_use]
    pub const fn color(&self) -> &'static str {
        match self {
            Self::Info => "#3498db",
            Self::Warning => "#f39c12",
            Self::Critical => "#e74c3c",
        }
    }

    /// Get display name for this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Critical => "Critical",
        }
    }
}

/// Outcome reported for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The action ran and the resource recovered.
    Success,
    /// The action ran and did not recover the resource.
    Failed,
    /// The healing ceiling was reached.
    GivenUp,
    /// Nothing was executed; a notice is attached.
    NoActionNeeded,
    /// The resource no longer exists.
    NotFound,
    /// Configuration drift was found and reverted.
    DriftDetected,
}

impl Outcome {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::GivenUp => "given_up",
            Self::NoActionNeeded => "no_action_needed",
            Self::NotFound => "not_found",
            Self::DriftDetected => "drift_detected",
        }
    }

    /// Severity used for presentation.
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self {
            Self::Success | Self::DriftDetected => Severity::Info,
            Self::Failed | Self::NoActionNeeded | Self::NotFound => Severity::Warning,
            Self::GivenUp => Severity::Critical,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification payload, serialised as-is by the webhook channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingMessage {
    pub resource_id: String,
    pub resource_kind: String,
    /// Action name, `none` when nothing ran.
    pub action: String,
    pub outcome: Outcome,
    pub attempt_count: u32,
    pub max_attempts: u32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl HealingMessage {
    /// One-line title for chat channels.
    #[must_use]
    pub fn title(&self) -> String {
        match self.outcome {
            Outcome::Success => format!("Healed {}", self.resource_id),
            Outcome::Failed => format!("Healing failed: {}", self.resource_id),
            Outcome::GivenUp => format!(
                "Manual intervention required: {}",
                self.resource_id
            ),
            Outcome::NoActionNeeded => format!("No healing action: {}", self.resource_id),
            Outcome::NotFound => format!("Resource not found: {}", self.resource_id),
            Outcome::DriftDetected => format!("Drift reverted: {}", self.resource_id),
        }
    }

    #[must_use]
    pub const fn severity(&self) -> Severity {
        self.outcome.severity()
    }
}
