//! Cloud provider abstractions.
//!
//! This module defines the common trait and types for cloud providers.

pub mod aws;
pub mod memory;
mod traits;

pub use traits::{
    attributes, AttributeValue, CloudProvider, CloudProviderError, DbModification,
    ResourceDescription, ResourceKind,
};

// Re-export provider clients
pub use aws::Aws;
pub use memory::SimulatedCloud;
