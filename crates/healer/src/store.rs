//! Durable healing metadata with revision-checked writes.
//!
//! Every store exposes the same contract: a read returns the metadata and the
//! revision it was read at, and a write only lands if the revision is still
//! the expected one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use healer_cloud::{CloudProvider, CloudProviderError, ResourceDescription, ResourceKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::retry::RetryPolicy;

/// Reserved metadata keys.
pub mod keys {
    pub const ATTEMPTS: &str = "HealingAttempts";
    pub const LAST_HEALED: &str = "LastHealed";
    pub const LAST_ACTION: &str = "HealingLastAction";
    pub const LAST_OUTCOME: &str = "HealingLastOutcome";
    pub const LAST_TRIGGER: &str = "HealingLastTrigger";
    pub const LEASE_UNTIL: &str = "HealingLeaseUntil";
    pub const REVISION: &str = "HealingRevision";
    /// Prefix of baseline overrides (`HealingDesired:allocatedStorage`).
    pub const DESIRED_PREFIX: &str = "HealingDesired:";

    /// Record keys removed by a reset.
    pub const RECORD: &[&str] = &[
        ATTEMPTS,
        LAST_HEALED,
        LAST_ACTION,
        LAST_OUTCOME,
        LAST_TRIGGER,
        LEASE_UNTIL,
    ];

    pub fn desired(field: &str) -> String {
        format!("{DESIRED_PREFIX}{field}")
    }

    pub fn is_reserved(key: &str) -> bool {
        key == REVISION || RECORD.contains(&key) || key.starts_with(DESIRED_PREFIX)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The revision moved since it was read.
    #[error("revision conflict: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(#[from] CloudProviderError),
}

/// Metadata of one resource at one revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    pub tags: BTreeMap<String, String>,
    pub revision: u64,
}

/// Storage for healing metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read the reserved keys and the current revision.
    async fn read(
        &self,
        resource_id: &str,
        kind: ResourceKind,
    ) -> Result<MetadataSnapshot, StoreError>;

    /// Apply `updates` and `removals` if the revision is still `expected_revision`.
    /// Returns the new revision.
    async fn write(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        expected_revision: u64,
        updates: &BTreeMap<String, String>,
        removals: &[String],
    ) -> Result<u64, StoreError>;

    /// Metadata already present in a fresh description of the resource.
    /// Stores that keep metadata elsewhere return `None` and are read instead.
    fn from_description(&self, _description: &ResourceDescription) -> Option<MetadataSnapshot> {
        None
    }
}

fn apply(
    tags: &mut BTreeMap<String, String>,
    updates: &BTreeMap<String, String>,
    removals: &[String],
) {
    for key in removals {
        tags.remove(key);
    }
    tags.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
}

fn check(expected: u64, actual: u64) -> Result<(), StoreError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StoreError::Conflict { expected, actual })
    }
}

// ============================================================================
// Resource tags
// ============================================================================

/// Metadata kept as tags on the resource itself.
///
/// Tag APIs have no compare-and-set, so the revision check is a
/// read-compare-write. Two writers passing the check in the same instant can
/// both land; the lease keeps that window small. Every provider call backs
/// off on transient errors.
pub struct ResourceTagStore {
    provider: Arc<dyn CloudProvider>,
    retry: RetryPolicy,
}

impl ResourceTagStore {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn snapshot(
        &self,
        resource_id: &str,
        kind: ResourceKind,
    ) -> Result<MetadataSnapshot, StoreError> {
        let resource = self
            .retry
            .run("describe", || self.provider.describe(resource_id, kind))
            .await?;
        Ok(tag_snapshot(&resource.tags))
    }
}

fn tag_snapshot(tags: &BTreeMap<String, String>) -> MetadataSnapshot {
    let revision = tags
        .get(keys::REVISION)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let tags = tags
        .iter()
        .filter(|(k, _)| keys::is_reserved(k) && k.as_str() != keys::REVISION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    MetadataSnapshot { tags, revision }
}

#[async_trait]
impl MetadataStore for ResourceTagStore {
    fn name(&self) -> &'static str {
        "resource-tags"
    }

    async fn read(
        &self,
        resource_id: &str,
        kind: ResourceKind,
    ) -> Result<MetadataSnapshot, StoreError> {
        self.snapshot(resource_id, kind).await
    }

    async fn write(
        &self,
        resource_id: &str,
        kind: ResourceKind,
        expected_revision: u64,
        updates: &BTreeMap<String, String>,
        removals: &[String],
    ) -> Result<u64, StoreError> {
        let current = self.snapshot(resource_id, kind).await?;
        check(expected_revision, current.revision)?;

        let revision = expected_revision + 1;
        let mut tags = updates.clone();
        tags.insert(keys::REVISION.to_string(), revision.to_string());

        let removals: Vec<String> = removals
            .iter()
            .filter(|k| !updates.contains_key(*k))
            .cloned()
            .collect();

        self.retry
            .run("create_tags", || self.provider.create_tags(resource_id, kind, &tags))
            .await?;
        self.retry
            .run("delete_tags", || self.provider.delete_tags(resource_id, kind, &removals))
            .await?;

        debug!(resource_id, revision, "Healing tags written");
        Ok(revision)
    }

    fn from_description(&self, description: &ResourceDescription) -> Option<MetadataSnapshot> {
        Some(tag_snapshot(&description.tags))
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-process compare-and-set store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MetadataSnapshot>>,
    writes: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MetadataSnapshot>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed metadata for a resource at revision 0.
    pub fn seed(&self, resource_id: &str, tags: BTreeMap<String, String>) {
        self.lock()
            .insert(resource_id.to_string(), MetadataSnapshot { tags, revision: 0 });
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self, resource_id: &str) -> MetadataSnapshot {
        self.lock().get(resource_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn read(
        &self,
        resource_id: &str,
        _kind: ResourceKind,
    ) -> Result<MetadataSnapshot, StoreError> {
        Ok(self.snapshot(resource_id))
    }

    async fn write(
        &self,
        resource_id: &str,
        _kind: ResourceKind,
        expected_revision: u64,
        updates: &BTreeMap<String, String>,
        removals: &[String],
    ) -> Result<u64, StoreError> {
        let revision = {
            let mut entries = self.lock();
            let entry = entries.entry(resource_id.to_string()).or_default();
            check(expected_revision, entry.revision)?;
            apply(&mut entry.tags, updates, removals);
            entry.revision += 1;
            entry.revision
        };
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(revision)
    }
}

// ============================================================================
// File
// ============================================================================

/// JSON document on disk keyed by resource id.
///
/// Writes replace the file atomically (temp file + rename). Compare-and-set
/// holds across tasks of one process; separate processes sharing a file are
/// not coordinated.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

type FileDocument = BTreeMap<String, MetadataSnapshot>;

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<FileDocument, StoreError> {
        if !self.path.exists() {
            return Ok(FileDocument::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(FileDocument::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save(&self, document: &FileDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(document)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn read(
        &self,
        resource_id: &str,
        _kind: ResourceKind,
    ) -> Result<MetadataSnapshot, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(resource_id).unwrap_or_default())
    }

    async fn write(
        &self,
        resource_id: &str,
        _kind: ResourceKind,
        expected_revision: u64,
        updates: &BTreeMap<String, String>,
        removals: &[String],
    ) -> Result<u64, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self.load()?;
        let entry = document.entry(resource_id.to_string()).or_default();
        check(expected_revision, entry.revision)?;
        apply(&mut entry.tags, updates, removals);
        entry.revision += 1;
        let revision = entry.revision;
        self.save(&document)?;
        debug!(resource_id, revision, path = %self.path.display(), "Healing state saved");
        Ok(revision)
    }
}
