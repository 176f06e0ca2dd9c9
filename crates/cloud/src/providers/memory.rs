//! In-memory simulated cloud.
//!
//! Used for dry runs and tests. Operations settle immediately unless the
//! resource is frozen, in which case it stays in the transitional status the
//! operation entered (useful for exercising timeouts).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::providers::traits::{
    attributes, AttributeValue, CloudProvider, CloudProviderError, DbModification,
    ResourceDescription, ResourceKind,
};

#[derive(Debug, Default)]
struct SimState {
    resources: BTreeMap<String, ResourceDescription>,
    frozen: BTreeSet<String>,
    /// Pending injected failures per operation name: (remaining, status).
    failures: BTreeMap<String, (u32, u16)>,
    calls: Vec<String>,
}

/// Simulated cloud provider backed by a map of resource descriptions.
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
}

/// Build a running compute instance description.
#[must_use]
pub fn compute_instance(id: &str, instance_type: &str, image_id: &str) -> ResourceDescription {
    let mut attrs = BTreeMap::new();
    attrs.insert(attributes::INSTANCE_TYPE.to_string(), instance_type.into());
    attrs.insert(attributes::IMAGE_ID.to_string(), image_id.into());
    attrs.insert(
        attributes::SECURITY_GROUPS.to_string(),
        AttributeValue::set(Vec::<String>::new()),
    );
    ResourceDescription {
        id: id.to_string(),
        kind: ResourceKind::Compute,
        status: "running".to_string(),
        attributes: attrs,
        tags: BTreeMap::new(),
        arn: None,
    }
}

/// Build an available database instance description.
#[must_use]
pub fn database_instance(id: &str, instance_class: &str, storage_gb: i64) -> ResourceDescription {
    let mut attrs = BTreeMap::new();
    attrs.insert(attributes::INSTANCE_CLASS.to_string(), instance_class.into());
    attrs.insert(
        attributes::ALLOCATED_STORAGE.to_string(),
        AttributeValue::Number(storage_gb),
    );
    attrs.insert(attributes::ENGINE_VERSION.to_string(), "15.4".into());
    attrs.insert(
        attributes::SECURITY_GROUPS.to_string(),
        AttributeValue::set(Vec::<String>::new()),
    );
    attrs.insert(attributes::MULTI_AZ.to_string(), AttributeValue::Flag(false));
    ResourceDescription {
        id: id.to_string(),
        kind: ResourceKind::Database,
        status: "available".to_string(),
        attributes: attrs,
        tags: BTreeMap::new(),
        arn: Some(format!("arn:sim:rds:local:000000000000:db:{id}")),
    }
}

impl SimulatedCloud {
    /// Create an empty simulated cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a simulated cloud seeded with resources.
    pub fn from_descriptions(resources: impl IntoIterator<Item = ResourceDescription>) -> Self {
        let cloud = Self::new();
        for resource in resources {
            cloud.insert(resource);
        }
        cloud
    }

    /// Builder form of [`SimulatedCloud::insert`].
    #[must_use]
    pub fn with_resource(self, resource: ResourceDescription) -> Self {
        self.insert(resource);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a resource.
    pub fn insert(&self, resource: ResourceDescription) {
        self.lock().resources.insert(resource.id.clone(), resource);
    }

    /// Remove a resource, so later calls report it as not found.
    pub fn remove(&self, id: &str) {
        self.lock().resources.remove(id);
    }

    /// Current snapshot of a resource.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<ResourceDescription> {
        self.lock().resources.get(id).cloned()
    }

    /// Force a status.
    pub fn set_status(&self, id: &str, status: &str) {
        if let Some(r) = self.lock().resources.get_mut(id) {
            r.status = status.to_string();
        }
    }

    /// Overwrite one attribute (drift injection).
    pub fn set_attribute(&self, id: &str, name: &str, value: AttributeValue) {
        if let Some(r) = self.lock().resources.get_mut(id) {
            r.attributes.insert(name.to_string(), value);
        }
    }

    /// Keep the resource in transitional statuses after mutating calls.
    pub fn freeze_status(&self, id: &str) {
        self.lock().frozen.insert(id.to_string());
    }

    /// Make the next `times` calls of `operation` fail with an API error.
    ///
    /// A 404 status yields [`CloudProviderError::NotFound`].
    pub fn fail_next(&self, operation: &str, times: u32, status: u16) {
        self.lock()
            .failures
            .insert(operation.to_string(), (times, status));
    }

    /// Operation log, formatted as `operation:id`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of logged calls of one operation.
    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Log the call, fire any injected failure, then run `f` on the resource.
    fn apply<T>(
        &self,
        operation: &str,
        id: &str,
        kind: ResourceKind,
        f: impl FnOnce(&mut ResourceDescription, bool) -> Result<T, CloudProviderError>,
    ) -> Result<T, CloudProviderError> {
        let mut state = self.lock();
        state.calls.push(format!("{operation}:{id}"));
        debug!(operation, resource_id = %id, "Simulated call");

        if let Some((remaining, status)) = state.failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                let status = *status;
                if status == 404 {
                    return Err(CloudProviderError::NotFound(id.to_string()));
                }
                return Err(CloudProviderError::Api {
                    status,
                    message: format!("injected failure for {operation}"),
                });
            }
        }

        let frozen = state.frozen.contains(id);
        match state.resources.get_mut(id) {
            Some(resource) if resource.kind == kind => f(resource, frozen),
            _ => Err(CloudProviderError::NotFound(format!("{kind} {id}"))),
        }
    }
}

fn settle(resource: &mut ResourceDescription, frozen: bool, transitional: &str, target: &str) {
    resource.status = if frozen { transitional } else { target }.to_string();
}

fn require_status(resource: &ResourceDescription, wanted: &str) -> Result<(), CloudProviderError> {
    if resource.status == wanted {
        Ok(())
    } else {
        Err(CloudProviderError::InvalidState(format!(
            "{} is {}, expected {wanted}",
            resource.id, resource.status
        )))
    }
}

#[async_trait]
impl CloudProvider for SimulatedCloud {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn describe(
        &self,
        id: &str,
        kind: ResourceKind,
    ) -> Result<ResourceDescription, CloudProviderError> {
        self.apply("describe", id, kind, |r, _| Ok(r.clone()))
    }

    async fn reboot_instance(&self, id: &str) -> Result<(), CloudProviderError> {
        self.apply("reboot_instance", id, ResourceKind::Compute, |r, frozen| {
            require_status(r, "running")?;
            settle(r, frozen, "pending", "running");
            Ok(())
        })
    }

    async fn stop_instance(&self, id: &str) -> Result<(), CloudProviderError> {
        self.apply("stop_instance", id, ResourceKind::Compute, |r, frozen| {
            settle(r, frozen, "stopping", "stopped");
            Ok(())
        })
    }

    async fn start_instance(&self, id: &str) -> Result<(), CloudProviderError> {
        self.apply("start_instance", id, ResourceKind::Compute, |r, frozen| {
            settle(r, frozen, "pending", "running");
            Ok(())
        })
    }

    async fn modify_instance_type(
        &self,
        id: &str,
        instance_type: &str,
    ) -> Result<(), CloudProviderError> {
        self.apply("modify_instance_type", id, ResourceKind::Compute, |r, _| {
            require_status(r, "stopped")?;
            r.attributes
                .insert(attributes::INSTANCE_TYPE.to_string(), instance_type.into());
            Ok(())
        })
    }

    async fn modify_instance_security_groups(
        &self,
        id: &str,
        groups: &[String],
    ) -> Result<(), CloudProviderError> {
        self.apply(
            "modify_instance_security_groups",
            id,
            ResourceKind::Compute,
            |r, _| {
                r.attributes.insert(
                    attributes::SECURITY_GROUPS.to_string(),
                    AttributeValue::set(groups.iter().cloned()),
                );
                Ok(())
            },
        )
    }

    async fn replace_root_volume(
        &self,
        id: &str,
        image_id: &str,
    ) -> Result<(), CloudProviderError> {
        self.apply("replace_root_volume", id, ResourceKind::Compute, |r, frozen| {
            r.attributes
                .insert(attributes::IMAGE_ID.to_string(), image_id.into());
            settle(r, frozen, "pending", "running");
            Ok(())
        })
    }

    async fn reboot_db_instance(
        &self,
        id: &str,
        force_failover: bool,
    ) -> Result<(), CloudProviderError> {
        self.apply("reboot_db_instance", id, ResourceKind::Database, |r, frozen| {
            let multi_az = r
                .attributes
                .get(attributes::MULTI_AZ)
                .and_then(AttributeValue::as_flag)
                .unwrap_or(false);
            if force_failover && !multi_az {
                return Err(CloudProviderError::InvalidState(format!(
                    "{} is not a Multi-AZ deployment",
                    r.id
                )));
            }
            settle(r, frozen, "rebooting", "available");
            Ok(())
        })
    }

    async fn modify_db_instance(
        &self,
        id: &str,
        modification: &DbModification,
    ) -> Result<(), CloudProviderError> {
        self.apply("modify_db_instance", id, ResourceKind::Database, |r, frozen| {
            if let Some(storage) = modification.allocated_storage {
                let current = r
                    .attributes
                    .get(attributes::ALLOCATED_STORAGE)
                    .and_then(AttributeValue::as_number)
                    .unwrap_or(0);
                if storage < current {
                    return Err(CloudProviderError::InvalidState(format!(
                        "allocated storage cannot shrink from {current} to {storage}"
                    )));
                }
                r.attributes.insert(
                    attributes::ALLOCATED_STORAGE.to_string(),
                    AttributeValue::Number(storage),
                );
            }
            if let Some(class) = &modification.instance_class {
                r.attributes
                    .insert(attributes::INSTANCE_CLASS.to_string(), class.as_str().into());
            }
            if let Some(groups) = &modification.security_groups {
                r.attributes.insert(
                    attributes::SECURITY_GROUPS.to_string(),
                    AttributeValue::set(groups.iter().cloned()),
                );
            }
            settle(r, frozen, "modifying", "available");
            Ok(())
        })
    }

    async fn restore_db_from_snapshot(&self, id: &str) -> Result<String, CloudProviderError> {
        let restored = self.apply(
            "restore_db_from_snapshot",
            id,
            ResourceKind::Database,
            |r, frozen| {
                let mut copy = r.clone();
                copy.id = format!("{id}-restored");
                copy.arn = Some(format!("arn:sim:rds:local:000000000000:db:{}", copy.id));
                copy.tags.clear();
                settle(&mut copy, frozen, "creating", "available");
                Ok(copy)
            },
        )?;

        let new_id = restored.id.clone();
        let frozen = {
            let mut state = self.lock();
            let frozen = state.frozen.contains(id);
            state.resources.insert(new_id.clone(), restored);
            frozen
        };
        if frozen {
            self.freeze_status(&new_id);
        }
        Ok(new_id)
    }

    async fn create_tags(
        &self,
        id: &str,
        kind: ResourceKind,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), CloudProviderError> {
        self.apply("create_tags", id, kind, |r, _| {
            r.tags
                .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    async fn delete_tags(
        &self,
        id: &str,
        kind: ResourceKind,
        keys: &[String],
    ) -> Result<(), CloudProviderError> {
        self.apply("delete_tags", id, kind, |r, _| {
            for key in keys {
                r.tags.remove(key);
            }
            Ok(())
        })
    }
}
