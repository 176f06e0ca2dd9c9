//! Cloud resource API consumed by the self-healing engine.
//!
//! This crate abstracts the provider calls the engine is allowed to make:
//!
//! - **Describe** - live attributes, status and tags in one call
//! - **Compute** - reboot, stop/start, modify attributes, re-image in place
//! - **Database** - reboot (with or without failover), modify, snapshot restore
//! - **Tags** - create and delete resource tags
//!
//! ## Providers
//!
//! 1. **AWS** - EC2 and RDS query endpoints
//! 2. **Simulated** - in-process state machine used by tests and local runs

pub mod providers;

pub use providers::{
    attributes, aws, memory, AttributeValue, CloudProvider, CloudProviderError, DbModification,
    ResourceDescription, ResourceKind,
};
