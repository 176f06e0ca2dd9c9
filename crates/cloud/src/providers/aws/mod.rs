//! AWS (Amazon Web Services) cloud provider.
//!
//! Implements the [`CloudProvider`](crate::CloudProvider) trait for AWS.
//!
//! ## Services
//!
//! - **EC2** (Elastic Compute Cloud) - compute instances
//! - **RDS** (Relational Database Service) - managed databases

mod client;
mod models;

pub use client::Aws;
pub use models::*;
