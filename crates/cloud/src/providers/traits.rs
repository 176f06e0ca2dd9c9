//! Cloud provider trait and common types.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during cloud provider operations.
#[derive(Error, Debug)]
pub enum CloudProviderError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication error.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The operation is not valid for the resource in its current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl CloudProviderError {
    /// Whether the error is a provider hiccup worth retrying.
    ///
    /// Transport failures, throttling and server-side errors are transient;
    /// missing resources, auth problems and client errors are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

// ============================================================================
// Resource types
// ============================================================================

/// Family of a managed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Virtual machine instance (EC2).
    Compute,
    /// Managed database instance (RDS).
    Database,
}

impl ResourceKind {
    /// Lowercase name used in logs and messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = CloudProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compute" | "ec2" | "instance" => Ok(Self::Compute),
            "database" | "rds" | "db" => Ok(Self::Database),
            other => Err(CloudProviderError::Config(format!(
                "unknown resource kind: {other}"
            ))),
        }
    }
}

/// Observable attribute names.
pub mod attributes {
    /// EC2 instance type (text).
    pub const INSTANCE_TYPE: &str = "instanceType";
    /// EC2 image id (text).
    pub const IMAGE_ID: &str = "imageId";
    /// Security group ids (set).
    pub const SECURITY_GROUPS: &str = "securityGroups";
    /// RDS instance class (text).
    pub const INSTANCE_CLASS: &str = "instanceClass";
    /// RDS allocated storage in GB (number).
    pub const ALLOCATED_STORAGE: &str = "allocatedStorage";
    /// RDS engine version (text).
    pub const ENGINE_VERSION: &str = "engineVersion";
    /// RDS Multi-AZ deployment (flag).
    pub const MULTI_AZ: &str = "multiAz";
}

/// Value of an observable resource attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Boolean attribute.
    Flag(bool),
    /// Integer attribute (sizes, counts).
    Number(i64),
    /// Plain string attribute.
    Text(String),
    /// Unordered collection, compared by membership.
    Set(BTreeSet<String>),
}

impl AttributeValue {
    /// Build a set value from any iterator of strings.
    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Set(items.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Self::Set(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
            Self::Set(items) => {
                let joined: Vec<&str> = items.iter().map(String::as_str).collect();
                write!(f, "[{}]", joined.join(","))
            }
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Flag(value)
    }
}

/// Result of a describe call: live attributes, status and tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescription {
    /// Provider identifier.
    pub id: String,
    /// Resource family.
    pub kind: ResourceKind,
    /// Raw provider status (`running`, `stopped`, `available`, ...).
    pub status: String,
    /// Observable attributes keyed by the names in [`attributes`].
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Provider ARN, when the provider addresses tags by ARN.
    pub arn: Option<String>,
}

/// Attribute changes for a database modify call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbModification {
    /// New instance class.
    pub instance_class: Option<String>,
    /// New allocated storage in GB.
    pub allocated_storage: Option<i64>,
    /// New VPC security group ids.
    pub security_groups: Option<Vec<String>>,
}

impl DbModification {
    /// True when no attribute would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instance_class.is_none()
            && self.allocated_storage.is_none()
            && self.security_groups.is_none()
    }
}

/// Trait for cloud providers.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &'static str;

    /// Describe a resource: attributes, status and tags in one pass.
    async fn describe(
        &self,
        id: &str,
        kind: ResourceKind,
    ) -> Result<ResourceDescription, CloudProviderError>;

    // ========================================================================
    // Compute operations
    // ========================================================================

    /// Reboot an instance.
    async fn reboot_instance(&self, id: &str) -> Result<(), CloudProviderError>;

    /// Stop an instance.
    async fn stop_instance(&self, id: &str) -> Result<(), CloudProviderError>;

    /// Start an instance.
    async fn start_instance(&self, id: &str) -> Result<(), CloudProviderError>;

    /// Change the instance type. The instance must be stopped.
    async fn modify_instance_type(
        &self,
        id: &str,
        instance_type: &str,
    ) -> Result<(), CloudProviderError>;

    /// Replace the security groups attached to an instance.
    async fn modify_instance_security_groups(
        &self,
        id: &str,
        groups: &[String],
    ) -> Result<(), CloudProviderError>;

    /// Re-image the root volume in place, keeping the instance id.
    async fn replace_root_volume(&self, id: &str, image_id: &str)
        -> Result<(), CloudProviderError>;

    // ========================================================================
    // Database operations
    // ========================================================================

    /// Reboot a database instance, optionally forcing a Multi-AZ failover.
    async fn reboot_db_instance(
        &self,
        id: &str,
        force_failover: bool,
    ) -> Result<(), CloudProviderError>;

    /// Modify a database instance, applying immediately.
    async fn modify_db_instance(
        &self,
        id: &str,
        modification: &DbModification,
    ) -> Result<(), CloudProviderError>;

    /// Restore from the latest restorable point. Returns the restored instance id.
    async fn restore_db_from_snapshot(&self, id: &str) -> Result<String, CloudProviderError>;

    // ========================================================================
    // Tags
    // ========================================================================

    /// Create or overwrite tags.
    async fn create_tags(
        &self,
        id: &str,
        kind: ResourceKind,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudProviderError>;

    /// Delete tags by key.
    async fn delete_tags(
        &self,
        id: &str,
        kind: ResourceKind,
        keys: &[String],
    ) -> Result<(), CloudProviderError>;

    /// Poll until the resource reports one of `wanted` statuses.
    async fn wait_for_status(
        &self,
        id: &str,
        kind: ResourceKind,
        wanted: &[&str],
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<ResourceDescription, CloudProviderError> {
        let start = Instant::now();

        loop {
            let resource = self.describe(id, kind).await?;

            debug!(
                resource_id = %id,
                status = %resource.status,
                elapsed_ms = start.elapsed().as_millis(),
                "Polling resource status"
            );

            if wanted.contains(&resource.status.as_str()) {
                return Ok(resource);
            }

            if start.elapsed() >= timeout {
                return Err(CloudProviderError::Timeout(timeout.as_secs()));
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}
