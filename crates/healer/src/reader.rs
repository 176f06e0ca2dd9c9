//! Resource State Reader: one fresh snapshot per invocation, no caching.

use std::collections::BTreeMap;
use std::sync::Arc;

use healer_cloud::{AttributeValue, CloudProvider, ResourceKind};
use tracing::{debug, warn};

use crate::error::{HealError, Result};
use crate::retry::RetryPolicy;
use crate::store::{keys, MetadataStore, StoreError};
use crate::types::ManagedResource;

/// Reads live attributes, status and healing metadata.
pub struct ResourceReader {
    provider: Arc<dyn CloudProvider>,
    store: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
}

/// Map store failures, keeping provider semantics (not found, transient).
pub(crate) fn store_error(err: StoreError) -> HealError {
    match err {
        StoreError::Provider(e) => HealError::from_provider(e),
        other => HealError::Store(other),
    }
}

impl ResourceReader {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        store: Arc<dyn MetadataStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            store,
            retry,
        }
    }

    /// Read the resource. `baseline` is the provisioning-time desired state;
    /// persisted `HealingDesired:*` overrides are layered on top of it.
    pub async fn read(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        baseline: &BTreeMap<String, AttributeValue>,
    ) -> Result<ManagedResource> {
        let description = self
            .retry
            .run("describe", || self.provider.describe(resource_id, kind))
            .await
            .map_err(HealError::from_provider)?;

        let metadata = match self.store.from_description(&description) {
            Some(metadata) => metadata,
            None => self
                .store
                .read(resource_id, kind)
                .await
                .map_err(store_error)?,
        };

        let mut desired_state = baseline.clone();
        for (key, value) in &metadata.tags {
            let Some(field) = key.strip_prefix(keys::DESIRED_PREFIX) else {
                continue;
            };
            match serde_json::from_str::<AttributeValue>(value) {
                Ok(v) => {
                    desired_state.insert(field.to_string(), v);
                }
                Err(e) => warn!(resource_id, key = %key, error = %e, "Ignoring malformed baseline override"),
            }
        }

        debug!(
            resource_id,
            status = %description.status,
            revision = metadata.revision,
            "Resource read"
        );

        Ok(ManagedResource {
            resource_id: description.id,
            resource_kind: kind,
            status: description.status,
            current_state: description.attributes,
            desired_state,
            tags: metadata.tags,
            tag_revision: metadata.revision,
        })
    }
}
