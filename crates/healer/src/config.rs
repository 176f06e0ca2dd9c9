//! Engine configuration.
//!
//! Loaded from an optional camelCase JSON file, then overridden by the
//! environment variables the provisioning layer sets on the handler.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use healer_cloud::{attributes, AttributeValue, ResourceKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HealError, Result};
use crate::retry::RetryPolicy;

/// Metric thresholds the alarms were created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Thresholds {
    pub cpu_percent: f64,
    pub free_storage_gb: f64,
    pub connections: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 80.0,
            free_storage_gb: 5.0,
            connections: 100.0,
        }
    }
}

/// How much storage to add when free space runs low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageGrowth {
    /// Double the allocation.
    Double,
    /// Add a fixed number of GB.
    Increment { gb: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoragePolicy {
    pub growth: StorageGrowth,
    pub max_allocated_gb: i64,
}

impl Default for StoragePolicy {
    fn default() -> Self {
        Self {
            growth: StorageGrowth::Double,
            max_allocated_gb: 65_536,
        }
    }
}

/// Baseline of one managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceBaseline {
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    #[serde(default)]
    pub desired_state: BTreeMap<String, AttributeValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsSettings {
    pub region: String,
    /// Endpoint override (signing proxy or local stack).
    pub endpoint: Option<String>,
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealerConfig {
    /// Healing ceiling.
    pub max_healing_attempts: u32,
    pub healing_timeout_seconds: u64,
    pub drift_check_interval_minutes: u64,
    /// Lease window; defaults to the healing timeout.
    pub lease_seconds: Option<u64>,
    /// Repeats of the same trigger within this window escalate.
    pub cycle_window_minutes: i64,
    pub poll_interval_seconds: u64,
    pub thresholds: Thresholds,
    pub storage: StoragePolicy,
    pub retry: RetryPolicy,
    pub ignored_fields: Vec<String>,
    pub default_resource_id: Option<String>,
    pub resources: Vec<ResourceBaseline>,
    pub aws: AwsSettings,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_healing_attempts: 3,
            healing_timeout_seconds: 300,
            drift_check_interval_minutes: 60,
            lease_seconds: None,
            cycle_window_minutes: 60,
            poll_interval_seconds: 15,
            thresholds: Thresholds::default(),
            storage: StoragePolicy::default(),
            retry: RetryPolicy::default(),
            ignored_fields: Vec::new(),
            default_resource_id: None,
            resources: Vec::new(),
            aws: AwsSettings::default(),
        }
    }
}

/// Upper bound for time windows (one year).
const MAX_WINDOW_SECS: u64 = 365 * 24 * 3600;

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    env(name)
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| HealError::Config(format!("{name} is not a valid number: {v}")))
        })
        .transpose()
}

impl HealerConfig {
    /// Load from an optional file, apply the environment, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    HealError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                serde_json::from_str(&content).map_err(|e| {
                    HealError::Config(format!("cannot parse {}: {e}", path.display()))
                })?
            }
            None => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;
        debug!(
            ceiling = config.max_healing_attempts,
            timeout_secs = config.healing_timeout_seconds,
            resources = config.resources.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_number("MAX_HEALING_ATTEMPTS")? {
            self.max_healing_attempts = v;
        }
        if let Some(v) = env_number("HEALING_TIMEOUT_SECONDS")? {
            self.healing_timeout_seconds = v;
        }
        if let Some(v) = env_number("DRIFT_CHECK_INTERVAL_MINUTES")? {
            self.drift_check_interval_minutes = v;
        }
        if let Some(v) = env_number("HEALING_LEASE_SECONDS")? {
            self.lease_seconds = Some(v);
        }
        if let Some(region) = env("AWS_REGION") {
            self.aws.region = region;
        }

        if let Some(id) = env("INSTANCE_ID") {
            let mut desired = BTreeMap::new();
            if let Some(v) = env("ORIGINAL_INSTANCE_TYPE") {
                desired.insert(attributes::INSTANCE_TYPE.to_string(), AttributeValue::Text(v));
            }
            if let Some(v) = env("ORIGINAL_AMI") {
                desired.insert(attributes::IMAGE_ID.to_string(), AttributeValue::Text(v));
            }
            self.adopt_default(id, ResourceKind::Compute, desired);
        } else if let Some(id) = env("DB_INSTANCE_ID") {
            let mut desired = BTreeMap::new();
            if let Some(v) = env("ORIGINAL_INSTANCE_CLASS") {
                desired.insert(attributes::INSTANCE_CLASS.to_string(), AttributeValue::Text(v));
            }
            if let Some(v) = env_number::<i64>("ORIGINAL_ALLOCATED_STORAGE")? {
                desired.insert(
                    attributes::ALLOCATED_STORAGE.to_string(),
                    AttributeValue::Number(v),
                );
            }
            if let Some(v) = env("ORIGINAL_ENGINE_VERSION") {
                desired.insert(attributes::ENGINE_VERSION.to_string(), AttributeValue::Text(v));
            }
            self.adopt_default(id, ResourceKind::Database, desired);
        }

        Ok(())
    }

    /// Make `id` the default resource, adding an env baseline if none is configured.
    fn adopt_default(
        &mut self,
        id: String,
        kind: ResourceKind,
        desired: BTreeMap<String, AttributeValue>,
    ) {
        if self.baseline(&id).is_none() {
            self.resources.push(ResourceBaseline {
                resource_id: id.clone(),
                resource_kind: kind,
                desired_state: desired,
            });
        }
        self.default_resource_id = Some(id);
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_healing_attempts < 1 {
            return Err(HealError::Config(
                "maxHealingAttempts must be at least 1".to_string(),
            ));
        }
        if self.healing_timeout_seconds < 1 {
            return Err(HealError::Config(
                "healingTimeoutSeconds must be at least 1".to_string(),
            ));
        }
        if self.storage.max_allocated_gb <= 0 {
            return Err(HealError::Config(
                "storage.maxAllocatedGb must be positive".to_string(),
            ));
        }
        if let StorageGrowth::Increment { gb } = self.storage.growth {
            if gb <= 0 {
                return Err(HealError::Config(
                    "storage.growth.increment.gb must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn baseline(&self, resource_id: &str) -> Option<&ResourceBaseline> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }

    /// Kind of a resource: its baseline entry, else inferred from the id
    /// (EC2 instance ids start with `i-`).
    pub fn resource_kind_of(&self, resource_id: &str) -> ResourceKind {
        self.baseline(resource_id).map_or_else(
            || {
                if resource_id.starts_with("i-") {
                    ResourceKind::Compute
                } else {
                    ResourceKind::Database
                }
            },
            |b| b.resource_kind,
        )
    }

    pub fn healing_timeout(&self) -> Duration {
        Duration::from_secs(self.healing_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn drift_check_interval(&self) -> Duration {
        Duration::from_secs(self.drift_check_interval_minutes * 60)
    }

    pub fn lease_window(&self) -> chrono::Duration {
        let secs = self
            .lease_seconds
            .unwrap_or(self.healing_timeout_seconds)
            .min(MAX_WINDOW_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(0))
    }

    pub fn cycle_window(&self) -> chrono::Duration {
        let max_minutes = i64::try_from(MAX_WINDOW_SECS / 60).unwrap_or(0);
        chrono::Duration::minutes(self.cycle_window_minutes.clamp(0, max_minutes))
    }
}
