//! Action Executor: runs one remediation against the provider.
//!
//! Provider calls happen in a fixed order per action and every wait shares one
//! deadline. Failures are reported in the result, never propagated.

use std::sync::Arc;
use std::time::{Duration, Instant};

use healer_cloud::{
    attributes, AttributeValue, CloudProvider, CloudProviderError, DbModification,
    ResourceKind,
};
use tracing::{info, warn};

use crate::drift::{as_number, is_drift};
use crate::types::{DriftDiff, ExecutionResult, ManagedResource, RemediationAction};

const RUNNING: &[&str] = &["running"];
const STOPPED: &[&str] = &["stopped"];
const AVAILABLE: &[&str] = &["available"];
const STORAGE_APPLIED: &[&str] = &["available", "storage-optimization"];

pub struct ActionExecutor {
    provider: Arc<dyn CloudProvider>,
    timeout: Duration,
    poll_interval: Duration,
}

impl ActionExecutor {
    pub fn new(provider: Arc<dyn CloudProvider>, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            provider,
            timeout,
            poll_interval,
        }
    }

    /// Run `action` against `resource`.
    pub async fn execute(
        &self,
        resource: &ManagedResource,
        action: &RemediationAction,
    ) -> ExecutionResult {
        let kind = resource.resource_kind;
        if !action.kind().supported_by(kind) {
            return ExecutionResult::failure(format!("{} is not supported for {kind}", action.kind()));
        }

        let deadline = Instant::now() + self.timeout;
        info!(resource_id = %resource.resource_id, action = %action, "Executing remediation");

        let outcome = match action {
            RemediationAction::RevertConfig { diff } => {
                return self.revert(resource, diff, deadline).await;
            }
            RemediationAction::Reboot => self.reboot(resource, deadline).await,
            RemediationAction::StopStart => self.stop_start(&resource.resource_id, &resource.status, deadline).await,
            RemediationAction::Recreate => self.recreate(resource, deadline).await,
            RemediationAction::FailoverToStandby => self.failover(&resource.resource_id, deadline).await,
            RemediationAction::RestoreFromSnapshot => self.restore(resource, deadline).await,
            RemediationAction::IncreaseStorage { target_gb } => {
                self.increase_storage(resource, *target_gb, deadline).await
            }
        };

        match outcome {
            Ok(detail) => ExecutionResult::success(detail),
            Err(e) => {
                warn!(resource_id = %resource.resource_id, action = %action, error = %e, "Remediation failed");
                ExecutionResult::failure(describe_error(&e))
            }
        }
    }

    async fn wait(
        &self,
        id: &str,
        kind: ResourceKind,
        wanted: &[&str],
        deadline: Instant,
    ) -> Result<(), CloudProviderError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CloudProviderError::Timeout(self.timeout.as_secs()));
        }
        self.provider
            .wait_for_status(id, kind, wanted, remaining, self.poll_interval)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                CloudProviderError::Timeout(_) => CloudProviderError::Timeout(self.timeout.as_secs()),
                other => other,
            })
    }

    async fn reboot(
        &self,
        resource: &ManagedResource,
        deadline: Instant,
    ) -> Result<String, CloudProviderError> {
        let id = &resource.resource_id;
        match resource.resource_kind {
            ResourceKind::Compute => {
                self.provider.reboot_instance(id).await?;
                self.wait(id, ResourceKind::Compute, RUNNING, deadline).await?;
            }
            ResourceKind::Database => {
                self.provider.reboot_db_instance(id, false).await?;
                self.wait(id, ResourceKind::Database, AVAILABLE, deadline).await?;
            }
        }
        Ok("rebooted".to_string())
    }

    async fn stop_start(
        &self,
        id: &str,
        status: &str,
        deadline: Instant,
    ) -> Result<String, CloudProviderError> {
        if status != "stopped" {
            self.provider.stop_instance(id).await?;
            self.wait(id, ResourceKind::Compute, STOPPED, deadline).await?;
        }
        self.provider.start_instance(id).await?;
        self.wait(id, ResourceKind::Compute, RUNNING, deadline).await?;
        Ok("stopped and started".to_string())
    }

    async fn recreate(
        &self,
        resource: &ManagedResource,
        deadline: Instant,
    ) -> Result<String, CloudProviderError> {
        let image_id = resource
            .desired_state
            .get(attributes::IMAGE_ID)
            .or_else(|| resource.current_state.get(attributes::IMAGE_ID))
            .and_then(AttributeValue::as_text)
            .ok_or_else(|| CloudProviderError::Config("no image id to recreate from".to_string()))?
            .to_string();

        self.provider
            .replace_root_volume(&resource.resource_id, &image_id)
            .await?;
        self.wait(&resource.resource_id, ResourceKind::Compute, RUNNING, deadline)
            .await?;
        Ok(format!("root volume replaced from {image_id}"))
    }

    async fn failover(&self, id: &str, deadline: Instant) -> Result<String, CloudProviderError> {
        self.provider.reboot_db_instance(id, true).await?;
        self.wait(id, ResourceKind::Database, AVAILABLE, deadline).await?;
        Ok("failed over to standby".to_string())
    }

    async fn restore(
        &self,
        resource: &ManagedResource,
        deadline: Instant,
    ) -> Result<String, CloudProviderError> {
        let restored = self
            .provider
            .restore_db_from_snapshot(&resource.resource_id)
            .await?;
        self.wait(&restored, ResourceKind::Database, AVAILABLE, deadline)
            .await?;
        Ok(format!("restored to new instance {restored}"))
    }

    async fn increase_storage(
        &self,
        resource: &ManagedResource,
        target_gb: i64,
        deadline: Instant,
    ) -> Result<String, CloudProviderError> {
        let current = resource.current_number(attributes::ALLOCATED_STORAGE);
        if current.is_some_and(|gb| gb >= target_gb) {
            return Ok(format!("storage already at {target_gb} GB or more"));
        }

        let modification = DbModification {
            allocated_storage: Some(target_gb),
            ..DbModification::default()
        };
        self.provider
            .modify_db_instance(&resource.resource_id, &modification)
            .await?;
        self.wait(&resource.resource_id, ResourceKind::Database, STORAGE_APPLIED, deadline)
            .await?;
        Ok(format!(
            "allocated storage increased from {} to {target_gb} GB",
            current.map_or_else(|| "?".to_string(), |gb| gb.to_string())
        ))
    }

    /// Re-read the resource and revert only what still differs.
    async fn revert(
        &self,
        resource: &ManagedResource,
        diff: &DriftDiff,
        deadline: Instant,
    ) -> ExecutionResult {
        let id = &resource.resource_id;
        let kind = resource.resource_kind;

        let live = match self.provider.describe(id, kind).await {
            Ok(live) => live,
            Err(e) => return ExecutionResult::failure(describe_error(&e)),
        };

        let pending: Vec<_> = diff
            .iter()
            .filter(|e| is_drift(&e.field, &e.desired, live.attributes.get(&e.field)))
            .collect();

        if pending.is_empty() {
            return ExecutionResult::success("already in desired state");
        }

        let mut reverted = vec![];
        let mut manual = vec![];

        let result = match kind {
            ResourceKind::Compute => {
                let mut instance_type = None;
                let mut groups = None;
                for entry in &pending {
                    match entry.field.as_str() {
                        attributes::INSTANCE_TYPE => instance_type = entry.desired.as_text(),
                        attributes::SECURITY_GROUPS => groups = entry.desired.as_set(),
                        other => manual.push(other.to_string()),
                    }
                }
                self.revert_compute(id, &live.status, instance_type, groups, &mut reverted, deadline)
                    .await
            }
            ResourceKind::Database => {
                let mut modification = DbModification::default();
                for entry in &pending {
                    match entry.field.as_str() {
                        attributes::INSTANCE_CLASS => {
                            modification.instance_class = entry.desired.as_text().map(str::to_string);
                        }
                        attributes::ALLOCATED_STORAGE => {
                            modification.allocated_storage = as_number(&entry.desired);
                        }
                        attributes::SECURITY_GROUPS => {
                            modification.security_groups =
                                entry.desired.as_set().map(|s| s.iter().cloned().collect());
                        }
                        other => manual.push(other.to_string()),
                    }
                }
                self.revert_database(id, &modification, &mut reverted, deadline)
                    .await
            }
        };

        let mut detail = if reverted.is_empty() {
            "nothing reverted".to_string()
        } else {
            format!("reverted {}", reverted.join(", "))
        };
        if !manual.is_empty() {
            detail.push_str(&format!(
                "; manual intervention required for {}",
                manual.join(", ")
            ));
        }

        match result {
            Ok(()) if manual.is_empty() => ExecutionResult::success(detail),
            Ok(()) => ExecutionResult::failure(detail),
            Err(e) => ExecutionResult::failure(format!("{detail}; {}", describe_error(&e))),
        }
    }

    async fn revert_compute(
        &self,
        id: &str,
        status: &str,
        instance_type: Option<&str>,
        groups: Option<&std::collections::BTreeSet<String>>,
        reverted: &mut Vec<String>,
        deadline: Instant,
    ) -> Result<(), CloudProviderError> {
        if let Some(groups) = groups {
            let groups: Vec<String> = groups.iter().cloned().collect();
            self.provider
                .modify_instance_security_groups(id, &groups)
                .await?;
            reverted.push(attributes::SECURITY_GROUPS.to_string());
        }

        if let Some(instance_type) = instance_type {
            if status != "stopped" {
                self.provider.stop_instance(id).await?;
                self.wait(id, ResourceKind::Compute, STOPPED, deadline).await?;
            }
            self.provider.modify_instance_type(id, instance_type).await?;
            self.provider.start_instance(id).await?;
            self.wait(id, ResourceKind::Compute, RUNNING, deadline).await?;
            reverted.push(attributes::INSTANCE_TYPE.to_string());
        }

        Ok(())
    }

    async fn revert_database(
        &self,
        id: &str,
        modification: &DbModification,
        reverted: &mut Vec<String>,
        deadline: Instant,
    ) -> Result<(), CloudProviderError> {
        if modification.is_empty() {
            return Ok(());
        }
        self.provider.modify_db_instance(id, modification).await?;
        self.wait(id, ResourceKind::Database, AVAILABLE, deadline).await?;

        if modification.instance_class.is_some() {
            reverted.push(attributes::INSTANCE_CLASS.to_string());
        }
        if modification.allocated_storage.is_some() {
            reverted.push(attributes::ALLOCATED_STORAGE.to_string());
        }
        if modification.security_groups.is_some() {
            reverted.push(attributes::SECURITY_GROUPS.to_string());
        }
        Ok(())
    }
}

fn describe_error(e: &CloudProviderError) -> String {
    match e {
        CloudProviderError::Timeout(secs) => format!("timeout after {secs}s waiting for the resource"),
        other => other.to_string(),
    }
}
