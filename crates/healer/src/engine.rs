//! Orchestration of one invocation:
//! read → detect drift → load record → plan → lease → execute → record → notify.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use healer_cloud::{attributes, AttributeValue, CloudProvider, ResourceKind};
use healer_notify::{Notifier, Outcome};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HealerConfig;
use crate::drift::DriftDetector;
use crate::error::{HealError, Result};
use crate::event::parse_event;
use crate::executor::ActionExecutor;
use crate::planner::{plan, PlannerPolicy};
use crate::reader::ResourceReader;
use crate::report::Reporter;
use crate::store::{MetadataStore, StoreError};
use crate::tracker::{AttemptReport, AttemptTracker};
use crate::types::{
    ActionKind, Decision, DriftDiff, HealingAttemptRecord, ManagedResource, RemediationAction,
    TriggerEvent,
};

/// Final status of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Healed,
    Failed,
    GivenUp,
    NoAction,
    Skipped,
    NotFound,
}

/// Result of one invocation, printed by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationReport {
    pub resource_id: String,
    pub status: InvocationStatus,
    pub action: Option<ActionKind>,
    pub attempt_count: u32,
    pub detail: String,
}

/// What the planner would do, without executing anything.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPreview {
    pub resource_id: String,
    pub resource_status: String,
    pub drift: DriftDiff,
    pub record: HealingAttemptRecord,
    pub action: Option<RemediationAction>,
    pub detail: String,
}

pub struct Engine {
    config: Arc<HealerConfig>,
    reader: ResourceReader,
    detector: DriftDetector,
    tracker: AttemptTracker,
    executor: ActionExecutor,
    reporter: Reporter,
    policy: PlannerPolicy,
}

impl Engine {
    pub fn new(
        config: HealerConfig,
        provider: Arc<dyn CloudProvider>,
        store: Arc<dyn MetadataStore>,
        notifier: Notifier,
    ) -> Self {
        let reader = ResourceReader::new(provider.clone(), store.clone(), config.retry.clone());
        let tracker = AttemptTracker::new(store, config.max_healing_attempts, config.lease_window());
        let executor = ActionExecutor::new(provider, config.healing_timeout(), config.poll_interval());

        Self {
            detector: DriftDetector::new(config.ignored_fields.clone()),
            reporter: Reporter::new(notifier, config.max_healing_attempts),
            policy: PlannerPolicy::from_config(&config),
            config: Arc::new(config),
            reader,
            tracker,
            executor,
        }
    }

    pub fn config(&self) -> &HealerConfig {
        &self.config
    }

    /// Parse a raw payload and handle it.
    pub async fn handle_payload(&self, payload: &Value) -> Result<InvocationReport> {
        match parse_event(payload, self.config.default_resource_id.as_deref())? {
            Some(event) => self.handle(&event).await,
            None => Ok(InvocationReport {
                resource_id: self.config.default_resource_id.clone().unwrap_or_default(),
                status: InvocationStatus::NoAction,
                action: None,
                attempt_count: 0,
                detail: "event requires no handling".to_string(),
            }),
        }
    }

    /// Handle one trigger event end to end.
    pub async fn handle(&self, event: &TriggerEvent) -> Result<InvocationReport> {
        let span = info_span!(
            "invocation",
            invocation_id = %Uuid::new_v4(),
            resource_id = %event.resource_id(),
            trigger = %event.kind()
        );
        self.handle_inner(event).instrument(span).await
    }

    fn baseline(&self, resource_id: &str) -> BTreeMap<String, AttributeValue> {
        self.config
            .baseline(resource_id)
            .map(|b| b.desired_state.clone())
            .unwrap_or_default()
    }

    async fn read(&self, resource_id: &str) -> Result<ManagedResource> {
        let kind = self.config.resource_kind_of(resource_id);
        self.reader
            .read(resource_id, kind, &self.baseline(resource_id))
            .await
    }

    async fn handle_inner(&self, event: &TriggerEvent) -> Result<InvocationReport> {
        let resource_id = event.resource_id();
        let kind = self.config.resource_kind_of(resource_id);

        let resource = match self.read(resource_id).await {
            Ok(resource) => resource,
            Err(HealError::NotFound(detail)) => {
                warn!(resource_id, "Resource not found");
                self.report(resource_id, kind, None, Outcome::NotFound, 0, &detail)
                    .await;
                return Ok(report(resource_id, InvocationStatus::NotFound, None, 0, detail));
            }
            Err(e) => {
                warn!(resource_id, error = %e, "Resource could not be read");
                let detail = format!("resource could not be read: {e}");
                self.report(resource_id, kind, None, Outcome::Failed, 0, &detail)
                    .await;
                return Err(e);
            }
        };

        let diff = if event.is_drift_check() {
            self.detector.detect(&resource)
        } else {
            DriftDiff::default()
        };
        if !diff.is_empty() {
            info!(resource_id, drift = %diff, "Drift detected");
        }

        let record = self.tracker.load(&resource);
        let now = Utc::now();

        let action = match plan(event, &resource, &diff, &record, &self.policy, now) {
            Ok(Decision::Act(action)) => action,
            Ok(Decision::NoActionNeeded { notice }) => {
                return Ok(self.no_action(&resource, &record, notice).await);
            }
            Err(HealError::CeilingReached { attempts, ceiling }) => {
                return self.ceiling_reached(&resource, &record, attempts, ceiling).await;
            }
            Err(e) => return Err(e),
        };

        let guard = match self.tracker.acquire_lease(&resource, now).await {
            Ok(guard) => guard,
            Err(HealError::LeaseHeld { until }) => {
                info!(resource_id, %until, "Another invocation holds the lease, skipping");
                return Ok(report(
                    resource_id,
                    InvocationStatus::Skipped,
                    Some(action.kind()),
                    record.attempt_count,
                    format!("lease held until {}", until.to_rfc3339()),
                ));
            }
            Err(HealError::Store(StoreError::Conflict { .. })) => {
                info!(resource_id, "Lost the lease race, skipping");
                return Ok(report(
                    resource_id,
                    InvocationStatus::Skipped,
                    Some(action.kind()),
                    record.attempt_count,
                    "concurrent invocation claimed the lease".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        let result = self.executor.execute(&resource, &action).await;

        let mut baseline_updates = BTreeMap::new();
        if let RemediationAction::IncreaseStorage { target_gb } = action {
            if result.succeeded {
                baseline_updates.insert(
                    attributes::ALLOCATED_STORAGE.to_string(),
                    AttributeValue::Number(target_gb),
                );
            }
        }

        let attempt = AttemptReport {
            action: action.kind(),
            succeeded: result.succeeded,
            trigger: event.kind(),
            baseline_updates,
            at: Utc::now(),
        };
        let record = match self.tracker.record(&guard, &resource, &attempt).await {
            Ok(record) => record,
            Err(e) => {
                // The action already ran, so it is reported even unrecorded.
                warn!(resource_id, action = %action.kind(), error = %e, "Attempt could not be recorded");
                let detail = format!(
                    "{} executed ({}) but the attempt could not be recorded: {e}",
                    action.kind(),
                    result.detail
                );
                self.report(
                    resource_id,
                    resource.resource_kind,
                    Some(action.kind()),
                    Outcome::Failed,
                    record.attempt_count.saturating_add(1),
                    &detail,
                )
                .await;
                return Err(e);
            }
        };

        let (outcome, status, detail) = if record.is_given_up() {
            (
                Outcome::GivenUp,
                InvocationStatus::GivenUp,
                format!(
                    "healing ceiling reached ({}/{}); manual intervention required. Last action: {}",
                    record.attempt_count,
                    self.tracker.ceiling(),
                    result.detail
                ),
            )
        } else if result.succeeded {
            let outcome = if matches!(action, RemediationAction::RevertConfig { .. }) {
                Outcome::DriftDetected
            } else {
                Outcome::Success
            };
            (outcome, InvocationStatus::Healed, result.detail)
        } else {
            (Outcome::Failed, InvocationStatus::Failed, result.detail)
        };

        info!(
            resource_id,
            action = %action.kind(),
            attempt = record.attempt_count,
            outcome = %outcome,
            "Invocation finished"
        );

        self.report(
            resource_id,
            resource.resource_kind,
            Some(action.kind()),
            outcome,
            record.attempt_count,
            &detail,
        )
        .await;

        Ok(report(
            resource_id,
            status,
            Some(action.kind()),
            record.attempt_count,
            detail,
        ))
    }

    async fn no_action(
        &self,
        resource: &ManagedResource,
        record: &HealingAttemptRecord,
        notice: Option<String>,
    ) -> InvocationReport {
        let detail = match notice {
            Some(notice) => {
                info!(resource_id = %resource.resource_id, notice = %notice, "No healing action");
                self.report(
                    &resource.resource_id,
                    resource.resource_kind,
                    None,
                    Outcome::NoActionNeeded,
                    record.attempt_count,
                    &notice,
                )
                .await;
                notice
            }
            None => "resource matches its baseline".to_string(),
        };

        report(
            &resource.resource_id,
            InvocationStatus::NoAction,
            None,
            record.attempt_count,
            detail,
        )
    }

    async fn ceiling_reached(
        &self,
        resource: &ManagedResource,
        record: &HealingAttemptRecord,
        attempts: u32,
        ceiling: u32,
    ) -> Result<InvocationReport> {
        let detail = format!(
            "healing ceiling reached ({attempts}/{ceiling}); manual intervention required"
        );

        if record.is_given_up() {
            info!(resource_id = %resource.resource_id, "Healing already given up, nothing to do");
        } else {
            warn!(resource_id = %resource.resource_id, attempts, ceiling, "Healing ceiling reached");
            self.tracker.mark_given_up(resource).await?;
            self.report(
                &resource.resource_id,
                resource.resource_kind,
                record.last_action,
                Outcome::GivenUp,
                attempts,
                &detail,
            )
            .await;
        }

        Ok(report(
            &resource.resource_id,
            InvocationStatus::GivenUp,
            None,
            attempts,
            detail,
        ))
    }

    /// Notify, logging and swallowing delivery failures.
    async fn report(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        action: Option<ActionKind>,
        outcome: Outcome,
        attempt_count: u32,
        detail: &str,
    ) {
        if let Err(e) = self
            .reporter
            .notify(resource_id, kind, action, outcome, attempt_count, detail)
            .await
        {
            warn!(resource_id, error = %e, "Notification unavailable, continuing");
        }
    }

    /// Read and plan without touching the resource or its record.
    pub async fn preview(&self, event: &TriggerEvent) -> Result<PlanPreview> {
        let resource = self.read(event.resource_id()).await?;
        let diff = if event.is_drift_check() {
            self.detector.detect(&resource)
        } else {
            DriftDiff::default()
        };
        let record = self.tracker.load(&resource);

        let (action, detail) = match plan(event, &resource, &diff, &record, &self.policy, Utc::now()) {
            Ok(Decision::Act(action)) => {
                let detail = format!("would execute {action}");
                (Some(action), detail)
            }
            Ok(Decision::NoActionNeeded { notice }) => (
                None,
                notice.unwrap_or_else(|| "no action needed".to_string()),
            ),
            Err(e @ HealError::CeilingReached { .. }) => (None, e.to_string()),
            Err(e) => return Err(e),
        };

        Ok(PlanPreview {
            resource_id: resource.resource_id,
            resource_status: resource.status,
            drift: diff,
            record,
            action,
            detail,
        })
    }

    /// Current healing record of a resource.
    pub async fn status(&self, resource_id: &str) -> Result<HealingAttemptRecord> {
        let resource = self.read(resource_id).await?;
        Ok(self.tracker.load(&resource))
    }

    /// Clear the healing record (external reset).
    pub async fn reset(&self, resource_id: &str) -> Result<()> {
        let kind = self.config.resource_kind_of(resource_id);
        self.tracker.reset(resource_id, kind).await
    }
}

fn report(
    resource_id: &str,
    status: InvocationStatus,
    action: Option<ActionKind>,
    attempt_count: u32,
    detail: String,
) -> InvocationReport {
    InvocationReport {
        resource_id: resource_id.to_string(),
        status,
        action,
        attempt_count,
        detail,
    }
}
