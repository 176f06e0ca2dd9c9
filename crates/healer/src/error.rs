//! Error taxonomy for the healing pipeline.

use chrono::{DateTime, Utc};
use healer_cloud::CloudProviderError;
use healer_notify::NotifyError;
use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the engine's components.
#[derive(Debug, Error)]
pub enum HealError {
    /// Provider kept failing transiently after the bounded retries.
    #[error("transient API error after retries: {0}")]
    TransientApi(#[source] CloudProviderError),

    /// The resource no longer exists.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The healing ceiling has been reached.
    #[error("healing ceiling reached ({attempts}/{ceiling} attempts)")]
    CeilingReached { attempts: u32, ceiling: u32 },

    /// An operation did not finish within the healing timeout.
    #[error("timed out after {0}s")]
    Timeout(u64),

    /// Another invocation holds the lease or won the race for it.
    #[error("lease held until {until}")]
    LeaseHeld { until: DateTime<Utc> },

    /// No notification channel accepted the message.
    #[error(transparent)]
    NotificationUnavailable(#[from] NotifyError),

    /// Metadata store failure.
    #[error("metadata store: {0}")]
    Store(#[from] StoreError),

    /// Non-transient provider failure (auth, validation).
    #[error("provider error: {0}")]
    Provider(#[source] CloudProviderError),

    /// The invocation payload could not be interpreted.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl HealError {
    /// Classify a provider error that escaped retries.
    pub fn from_provider(err: CloudProviderError) -> Self {
        match err {
            CloudProviderError::NotFound(id) => Self::NotFound(id),
            CloudProviderError::Timeout(secs) => Self::Timeout(secs),
            e if e.is_transient() => Self::TransientApi(e),
            e => Self::Provider(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, HealError>;
