//! VMops CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the VMops controllers.

pub mod address_claim;
pub mod condition;
pub mod deployment_zone;
pub mod failure_domain;
pub mod references;
pub mod virtual_machine;
pub mod vm_cluster;

pub use address_claim::*;
pub use condition::*;
pub use deployment_zone::*;
pub use failure_domain::*;
pub use references::*;
pub use virtual_machine::*;
pub use vm_cluster::*;
