//! The controller's only view of the cluster: service-account discovery and
//! per-identity secret storage behind the [`ClusterClient`] trait.

pub mod client;
pub mod error;
pub mod kubernetes;
pub mod memory;

pub use client::{ClusterClient, IdentityList, IdentityStream};
pub use error::ClusterError;
pub use kubernetes::KubeCluster;
pub use memory::{ClusterStats, MemoryCluster};
