//! Drift Detector: compares live attributes against the recorded baseline.

use std::collections::BTreeSet;

use healer_cloud::{attributes, AttributeValue, ResourceKind};

use crate::types::{DriftDiff, DriftEntry, ManagedResource};

/// Attributes that are compared for each resource kind.
pub fn tracked_fields(kind: ResourceKind) -> &'static [&'static str] {
    match kind {
        ResourceKind::Compute => &[
            attributes::IMAGE_ID,
            attributes::INSTANCE_TYPE,
            attributes::SECURITY_GROUPS,
        ],
        ResourceKind::Database => &[
            attributes::ALLOCATED_STORAGE,
            attributes::ENGINE_VERSION,
            attributes::INSTANCE_CLASS,
            attributes::SECURITY_GROUPS,
        ],
    }
}

/// Fields where growth past the baseline is expected change.
fn is_grow_only(field: &str) -> bool {
    field == attributes::ALLOCATED_STORAGE
}

/// Exact match, tolerating a number recorded as text (`"20"` vs `20`).
fn values_match(desired: &AttributeValue, current: &AttributeValue) -> bool {
    desired == current || desired.to_string() == current.to_string()
}

/// Whether `current` violates `desired` for `field`.
pub fn is_drift(field: &str, desired: &AttributeValue, current: Option<&AttributeValue>) -> bool {
    let Some(current) = current else {
        return true;
    };
    if is_grow_only(field) {
        if let (Some(want), Some(have)) = (as_number(desired), as_number(current)) {
            return have < want;
        }
    }
    !values_match(desired, current)
}

pub(crate) fn as_number(value: &AttributeValue) -> Option<i64> {
    match value {
        AttributeValue::Number(n) => Some(*n),
        AttributeValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Compares current and desired state.
#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    ignored: BTreeSet<String>,
}

impl DriftDetector {
    pub fn new(ignored_fields: impl IntoIterator<Item = String>) -> Self {
        Self {
            ignored: ignored_fields.into_iter().collect(),
        }
    }

    /// Fields that differ, ordered by name. Empty when in sync.
    pub fn detect(&self, resource: &ManagedResource) -> DriftDiff {
        let mut entries: Vec<DriftEntry> = tracked_fields(resource.resource_kind)
            .iter()
            .filter(|field| !self.ignored.contains(**field))
            .filter_map(|field| {
                let desired = resource.desired_state.get(*field)?;
                let current = resource.current_state.get(*field);
                is_drift(field, desired, current).then(|| DriftEntry {
                    field: (*field).to_string(),
                    desired: desired.clone(),
                    current: current.cloned(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.field.cmp(&b.field));
        DriftDiff(entries)
    }
}
