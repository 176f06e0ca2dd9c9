//! Self-healing engine for cloud compute and database instances.
//!
//! One invocation handles one trigger (health-check failure, metric alarm or
//! scheduled drift check) for one resource:
//!
//! 1. [`reader`] reads live state and the healing metadata
//! 2. [`drift`] compares the live state against the baseline
//! 3. [`planner`] picks at most one action, bounded by the healing ceiling
//! 4. [`tracker`] claims a lease on the resource's metadata
//! 5. [`executor`] runs the action and waits for the terminal state
//! 6. [`tracker`] records the attempt, [`report`] notifies the outcome
//!
//! [`engine::Engine`] wires the steps together.

pub mod config;
pub mod drift;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod planner;
pub mod reader;
pub mod report;
pub mod retry;
pub mod store;
pub mod tracker;
pub mod types;

pub use config::HealerConfig;
pub use engine::{Engine, InvocationReport, InvocationStatus, PlanPreview};
pub use error::{HealError, Result};
pub use event::parse_event;
pub use store::{FileStore, MemoryStore, MetadataStore, ResourceTagStore, StoreError};
pub use types::{
    ActionKind, Decision, DriftDiff, HealingAttemptRecord, ManagedResource, RemediationAction,
    TriggerEvent,
};
