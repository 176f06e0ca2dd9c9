//! Attempt Tracker: durable attempt counts, the lease, and the ceiling.
//!
//! All writes are conditional on the metadata revision. Claiming the lease
//! fails fast on a lost race; recording an attempt re-reads and re-applies the
//! increment so concurrent writers never undercount.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use healer_cloud::{AttributeValue, ResourceKind};
use tracing::{debug, info, warn};

use crate::error::{HealError, Result};
use crate::reader::store_error;
use crate::store::{keys, MetadataStore, StoreError};
use crate::types::{ActionKind, AttemptOutcome, HealingAttemptRecord, ManagedResource, TriggerKind};

/// Re-read/re-apply rounds for a conflicting write.
const WRITE_ATTEMPTS: u32 = 3;

/// Proof that this invocation holds the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGuard {
    pub resource_id: String,
    pub resource_kind: ResourceKind,
    /// Revision written by the lease claim.
    pub revision: u64,
    pub expires_at: DateTime<Utc>,
}

/// Decode the healing record from reserved metadata keys.
///
/// Malformed values decode to their defaults.
pub fn record_from_tags(tags: &BTreeMap<String, String>) -> HealingAttemptRecord {
    let parse_time = |key: &str| {
        tags.get(key)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    };

    HealingAttemptRecord {
        attempt_count: tags
            .get(keys::ATTEMPTS)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        last_attempt_at: parse_time(keys::LAST_HEALED),
        last_action: tags.get(keys::LAST_ACTION).and_then(|v| v.parse().ok()),
        last_outcome: tags.get(keys::LAST_OUTCOME).and_then(|v| v.parse().ok()),
        last_trigger: tags.get(keys::LAST_TRIGGER).and_then(|v| v.parse().ok()),
        lease_expires_at: parse_time(keys::LEASE_UNTIL),
    }
}

/// One executed attempt, as handed to [`AttemptTracker::record`].
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub action: ActionKind,
    pub succeeded: bool,
    pub trigger: TriggerKind,
    /// Baseline fields changed on purpose by the action.
    pub baseline_updates: BTreeMap<String, AttributeValue>,
    pub at: DateTime<Utc>,
}

pub struct AttemptTracker {
    store: Arc<dyn MetadataStore>,
    ceiling: u32,
    lease_window: chrono::Duration,
}

impl AttemptTracker {
    pub fn new(store: Arc<dyn MetadataStore>, ceiling: u32, lease_window: chrono::Duration) -> Self {
        Self {
            store,
            ceiling,
            lease_window,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Healing record as of the reader's snapshot.
    pub fn load(&self, resource: &ManagedResource) -> HealingAttemptRecord {
        record_from_tags(&resource.tags)
    }

    /// Claim the lease at the revision the resource was read at.
    ///
    /// Returns [`HealError::LeaseHeld`] if another invocation holds an
    /// unexpired lease, or a store conflict if the claim lost a race.
    pub async fn acquire_lease(
        &self,
        resource: &ManagedResource,
        now: DateTime<Utc>,
    ) -> Result<LeaseGuard> {
        let record = self.load(resource);
        if let Some(until) = record.lease_expires_at.filter(|until| *until > now) {
            return Err(HealError::LeaseHeld { until });
        }

        let expires_at = now + self.lease_window;
        let mut updates = BTreeMap::new();
        updates.insert(keys::LEASE_UNTIL.to_string(), expires_at.to_rfc3339());

        let revision = self
            .store
            .write(
                &resource.resource_id,
                resource.resource_kind,
                resource.tag_revision,
                &updates,
                &[],
            )
            .await
            .map_err(store_error)?;

        debug!(resource_id = %resource.resource_id, %expires_at, revision, "Lease acquired");

        Ok(LeaseGuard {
            resource_id: resource.resource_id.clone(),
            resource_kind: resource.resource_kind,
            revision,
            expires_at,
        })
    }

    /// Record an executed attempt and release the lease.
    ///
    /// The count is incremented on whatever record is current when the write
    /// lands. Reaching the ceiling forces the outcome to `GivenUp`.
    pub async fn record(
        &self,
        guard: &LeaseGuard,
        resource: &ManagedResource,
        attempt: &AttemptReport,
    ) -> Result<HealingAttemptRecord> {
        let mut expected = guard.revision;
        let mut base = self.load(resource);
        let mut round = 1;

        loop {
            let next = self.next_record(&base, attempt);
            let updates = Self::record_updates(&next, attempt);

            match self
                .store
                .write(
                    &guard.resource_id,
                    guard.resource_kind,
                    expected,
                    &updates,
                    &[keys::LEASE_UNTIL.to_string()],
                )
                .await
            {
                Ok(revision) => {
                    info!(
                        resource_id = %guard.resource_id,
                        action = %attempt.action,
                        attempt = next.attempt_count,
                        outcome = next.last_outcome.map_or("", AttemptOutcome::as_str),
                        revision,
                        "Healing attempt recorded"
                    );
                    return Ok(next);
                }
                Err(StoreError::Conflict { actual, .. }) if round < WRITE_ATTEMPTS => {
                    warn!(
                        resource_id = %guard.resource_id,
                        expected,
                        actual,
                        "Attempt record conflicted, re-reading"
                    );
                    round += 1;
                    let fresh = self
                        .store
                        .read(&guard.resource_id, guard.resource_kind)
                        .await
                        .map_err(store_error)?;
                    base = record_from_tags(&fresh.tags);
                    expected = fresh.revision;
                }
                // The last conflict surfaces with the revision actually found.
                Err(e) => return Err(store_error(e)),
            }
        }
    }

    fn next_record(&self, base: &HealingAttemptRecord, attempt: &AttemptReport) -> HealingAttemptRecord {
        let attempt_count = (base.attempt_count + 1).min(self.ceiling);
        let last_outcome = if attempt_count >= self.ceiling {
            AttemptOutcome::GivenUp
        } else if attempt.succeeded {
            AttemptOutcome::Success
        } else {
            AttemptOutcome::Failed
        };

        HealingAttemptRecord {
            attempt_count,
            last_attempt_at: Some(attempt.at),
            last_action: Some(attempt.action),
            last_outcome: Some(last_outcome),
            last_trigger: Some(attempt.trigger),
            lease_expires_at: None,
        }
    }

    fn record_updates(
        record: &HealingAttemptRecord,
        attempt: &AttemptReport,
    ) -> BTreeMap<String, String> {
        let mut updates = BTreeMap::new();
        updates.insert(keys::ATTEMPTS.to_string(), record.attempt_count.to_string());
        updates.insert(keys::LAST_HEALED.to_string(), attempt.at.to_rfc3339());
        updates.insert(keys::LAST_ACTION.to_string(), attempt.action.as_str().to_string());
        if let Some(outcome) = record.last_outcome {
            updates.insert(keys::LAST_OUTCOME.to_string(), outcome.as_str().to_string());
        }
        updates.insert(keys::LAST_TRIGGER.to_string(), attempt.trigger.key());
        for (field, value) in &attempt.baseline_updates {
            if let Ok(encoded) = serde_json::to_string(value) {
                updates.insert(keys::desired(field), encoded);
            }
        }
        updates
    }

    /// Mark the record terminal without counting an attempt.
    pub async fn mark_given_up(&self, resource: &ManagedResource) -> Result<HealingAttemptRecord> {
        let mut updates = BTreeMap::new();
        updates.insert(
            keys::LAST_OUTCOME.to_string(),
            AttemptOutcome::GivenUp.as_str().to_string(),
        );

        let revision = self
            .write_with_retry(
                &resource.resource_id,
                resource.resource_kind,
                resource.tag_revision,
                &updates,
                &[],
            )
            .await?;

        info!(resource_id = %resource.resource_id, revision, "Healing record marked given up");

        let mut record = self.load(resource);
        record.last_outcome = Some(AttemptOutcome::GivenUp);
        Ok(record)
    }

    /// Remove every reserved healing key (external reset).
    pub async fn reset(&self, resource_id: &str, kind: ResourceKind) -> Result<()> {
        let snapshot = self
            .store
            .read(resource_id, kind)
            .await
            .map_err(store_error)?;
        let removals: Vec<String> = snapshot
            .tags
            .keys()
            .filter(|k| keys::is_reserved(k))
            .cloned()
            .collect();

        self.write_with_retry(resource_id, kind, snapshot.revision, &BTreeMap::new(), &removals)
            .await?;
        info!(resource_id, removed = removals.len(), "Healing record reset");
        Ok(())
    }

    /// Write fixed content, refreshing the expected revision on conflict.
    async fn write_with_retry(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        mut expected: u64,
        updates: &BTreeMap<String, String>,
        removals: &[String],
    ) -> Result<u64> {
        let mut round = 1;
        loop {
            match self
                .store
                .write(resource_id, kind, expected, updates, removals)
                .await
            {
                Ok(revision) => return Ok(revision),
                Err(StoreError::Conflict { actual, .. }) if round < WRITE_ATTEMPTS => {
                    round += 1;
                    expected = actual;
                }
                Err(e) => return Err(store_error(e)),
            }
        }
    }
}
