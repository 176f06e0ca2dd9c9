//! Core types shared by the healing pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use healer_cloud::{attributes, AttributeValue, ResourceKind};
use serde::{Deserialize, Serialize};

// ============================================================================
// Resource
// ============================================================================

/// A resource under management, as seen by one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    /// Provider status string (`running`, `stopped`, `available`, ...).
    pub status: String,
    /// Live attribute values.
    pub current_state: BTreeMap<String, AttributeValue>,
    /// Baseline recorded at provisioning time plus persisted overrides.
    pub desired_state: BTreeMap<String, AttributeValue>,
    /// Healing metadata as read from the metadata store.
    pub tags: BTreeMap<String, String>,
    /// Store revision the tags were read at.
    pub tag_revision: u64,
}

impl ManagedResource {
    /// Whether the provider reports the instance as stopped.
    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }

    /// Whether the database has a standby to fail over to.
    pub fn is_multi_az(&self) -> bool {
        self.current_state
            .get(attributes::MULTI_AZ)
            .and_then(AttributeValue::as_flag)
            .unwrap_or(false)
    }

    pub fn current_number(&self, field: &str) -> Option<i64> {
        self.current_state
            .get(field)
            .and_then(AttributeValue::as_number)
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Severity of a health-check failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureSeverity {
    Low,
    High,
}

impl FromStr for FailureSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "warning" | "minor" => Ok(Self::Low),
            "high" | "critical" | "major" => Ok(Self::High),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// Metric families the planner distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Cpu,
    FreeStorage,
    Connections,
    Other,
}

impl MetricKind {
    /// Classify a metric or alarm name (`CPUUtilization`, `FreeStorageSpace`, ...).
    pub fn classify(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("cpu") {
            Self::Cpu
        } else if name.contains("storage") {
            Self::FreeStorage
        } else if name.contains("connection") {
            Self::Connections
        } else {
            Self::Other
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::FreeStorage => "free_storage",
            Self::Connections => "connections",
            Self::Other => "other",
        }
    }
}

/// Failure family used for escalation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    HealthCheck,
    Metric(MetricKind),
    Drift,
}

impl TriggerKind {
    /// Key persisted in `HealingLastTrigger`.
    pub fn key(self) -> String {
        match self {
            Self::HealthCheck => "health_check".to_string(),
            Self::Metric(metric) => format!("metric:{}", metric.as_str()),
            Self::Drift => "drift".to_string(),
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "health_check" => Ok(Self::HealthCheck),
            "drift" => Ok(Self::Drift),
            "metric:cpu" => Ok(Self::Metric(MetricKind::Cpu)),
            "metric:free_storage" => Ok(Self::Metric(MetricKind::FreeStorage)),
            "metric:connections" => Ok(Self::Metric(MetricKind::Connections)),
            "metric:other" => Ok(Self::Metric(MetricKind::Other)),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

/// What caused an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerEvent {
    HealthCheckFailure {
        resource_id: String,
        severity: FailureSeverity,
    },
    PerformanceAlarm {
        resource_id: String,
        metric_name: String,
        observed_value: f64,
        threshold: f64,
    },
    ScheduledDriftCheck {
        resource_id: String,
    },
}

impl TriggerEvent {
    pub fn resource_id(&self) -> &str {
        match self {
            Self::HealthCheckFailure { resource_id, .. }
            | Self::PerformanceAlarm { resource_id, .. }
            | Self::ScheduledDriftCheck { resource_id } => resource_id,
        }
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::HealthCheckFailure { .. } => TriggerKind::HealthCheck,
            Self::PerformanceAlarm { metric_name, .. } => {
                TriggerKind::Metric(MetricKind::classify(metric_name))
            }
            Self::ScheduledDriftCheck { .. } => TriggerKind::Drift,
        }
    }

    pub fn is_drift_check(&self) -> bool {
        matches!(self, Self::ScheduledDriftCheck { .. })
    }
}

// ============================================================================
// Drift
// ============================================================================

/// One field whose live value differs from the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEntry {
    pub field: String,
    pub desired: AttributeValue,
    /// `None` when the provider no longer reports the field.
    pub current: Option<AttributeValue>,
}

/// Differences ordered by field name. Empty means no drift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriftDiff(pub Vec<DriftEntry>);

impl DriftDiff {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DriftEntry> {
        self.0.iter()
    }

    pub fn get(&self, field: &str) -> Option<&DriftEntry> {
        self.0.iter().find(|e| e.field == field)
    }

    pub fn fields(&self) -> Vec<&str> {
        self.0.iter().map(|e| e.field.as_str()).collect()
    }
}

impl fmt::Display for DriftDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|e| {
                let current = e
                    .current
                    .as_ref()
                    .map_or_else(|| "<missing>".to_string(), ToString::to_string);
                format!("{}: {} -> {}", e.field, current, e.desired)
            })
            .collect();
        f.write_str(&parts.join(", "))
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Field-less action discriminant, persisted in `HealingLastAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reboot,
    StopStart,
    RevertConfig,
    Recreate,
    IncreaseStorage,
    FailoverToStandby,
    RestoreFromSnapshot,
}

impl ActionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reboot => "reboot",
            Self::StopStart => "stop_start",
            Self::RevertConfig => "revert_config",
            Self::Recreate => "recreate",
            Self::IncreaseStorage => "increase_storage",
            Self::FailoverToStandby => "failover_to_standby",
            Self::RestoreFromSnapshot => "restore_from_snapshot",
        }
    }

    /// Position on the escalation ladder, if the action is on it.
    pub const fn ladder_tier(self) -> Option<u8> {
        match self {
            Self::Reboot => Some(1),
            Self::StopStart | Self::FailoverToStandby => Some(2),
            Self::Recreate | Self::RestoreFromSnapshot => Some(3),
            Self::RevertConfig | Self::IncreaseStorage => None,
        }
    }

    pub const fn supported_by(self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Compute => matches!(
                self,
                Self::Reboot | Self::StopStart | Self::RevertConfig | Self::Recreate
            ),
            ResourceKind::Database => matches!(
                self,
                Self::Reboot
                    | Self::RevertConfig
                    | Self::IncreaseStorage
                    | Self::FailoverToStandby
                    | Self::RestoreFromSnapshot
            ),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Reboot,
            Self::StopStart,
            Self::RevertConfig,
            Self::Recreate,
            Self::IncreaseStorage,
            Self::FailoverToStandby,
            Self::RestoreFromSnapshot,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
        .ok_or_else(|| format!("unknown action: {s}"))
    }
}

/// A corrective action with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RemediationAction {
    Reboot,
    StopStart,
    RevertConfig { diff: DriftDiff },
    Recreate,
    IncreaseStorage { target_gb: i64 },
    FailoverToStandby,
    RestoreFromSnapshot,
}

impl RemediationAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Reboot => ActionKind::Reboot,
            Self::StopStart => ActionKind::StopStart,
            Self::RevertConfig { .. } => ActionKind::RevertConfig,
            Self::Recreate => ActionKind::Recreate,
            Self::IncreaseStorage { .. } => ActionKind::IncreaseStorage,
            Self::FailoverToStandby => ActionKind::FailoverToStandby,
            Self::RestoreFromSnapshot => ActionKind::RestoreFromSnapshot,
        }
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RevertConfig { diff } => write!(f, "revert_config [{diff}]"),
            Self::IncreaseStorage { target_gb } => write!(f, "increase_storage to {target_gb} GB"),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// What the planner decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Act(RemediationAction),
    /// Nothing to execute. A notice means the outcome is still reported.
    NoActionNeeded { notice: Option<String> },
}

/// Result of running one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub succeeded: bool,
    pub detail: String,
}

impl ExecutionResult {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            detail: detail.into(),
        }
    }
}

// ============================================================================
// Attempt record
// ============================================================================

/// Outcome persisted in `HealingLastOutcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failed,
    GivenUp,
}

impl AttemptOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::GivenUp => "given_up",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "given_up" => Ok(Self::GivenUp),
            other => Err(format!("unknown outcome: {other}")),
        }
    }
}

/// Durable healing history of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingAttemptRecord {
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_action: Option<ActionKind>,
    pub last_outcome: Option<AttemptOutcome>,
    #[serde(serialize_with = "serialize_trigger")]
    pub last_trigger: Option<TriggerKind>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

fn serialize_trigger<S: serde::Serializer>(
    trigger: &Option<TriggerKind>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match trigger {
        Some(t) => serializer.serialize_some(&t.key()),
        None => serializer.serialize_none(),
    }
}

impl HealingAttemptRecord {
    pub fn is_given_up(&self) -> bool {
        self.last_outcome == Some(AttemptOutcome::GivenUp)
    }

    /// Whether another invocation holds an unexpired lease.
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|until| until > now)
    }
}
